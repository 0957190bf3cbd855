use crate::domain_utils::DomainUtils;
use base64::Engine as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// Attachment metadata as reported by the mailbox collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub size: u64,
}

/// A decoded email handed to the engine. Never mutated by analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: String,
    /// Raw From header, e.g. `Alice <alice@example.com>`
    pub sender: String,
    pub subject: String,
    /// RFC 2822 date string, passed through untouched
    pub date: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Connecting client address, when the intake side could recover it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SenderError {
    #[error("sender header has no '@': {0:?}")]
    MissingAt(String),
    #[error("invalid sender domain: {0:?}")]
    InvalidDomain(String),
    #[error("unterminated address in sender header: {0:?}")]
    UnterminatedAddress(String),
}

impl EmailRecord {
    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Read a raw RFC 5322 message. Multipart bodies are kept as-is; only a
    /// single-part base64 body is decoded.
    pub fn from_eml(content: &str, fallback_id: &str) -> Self {
        let mut headers: HashMap<String, String> = HashMap::new();
        let mut first_received: Option<String> = None;
        let mut collecting_received = false;
        let mut body = String::new();
        let mut in_headers = true;
        let mut last_header_key: Option<String> = None;

        for line in content.lines() {
            if in_headers {
                if line.trim().is_empty() {
                    in_headers = false;
                    continue;
                }

                if line.starts_with(' ') || line.starts_with('\t') {
                    match last_header_key.as_deref() {
                        Some("received") if collecting_received => {
                            if let Some(received) = first_received.as_mut() {
                                received.push(' ');
                                received.push_str(line.trim());
                            }
                        }
                        Some(key) => {
                            if let Some(existing_value) = headers.get_mut(key) {
                                existing_value.push(' ');
                                existing_value.push_str(line.trim());
                            }
                        }
                        None => {}
                    }
                    continue;
                }

                if let Some((key, value)) = line.split_once(':') {
                    let key = key.trim().to_lowercase();
                    let value = value.trim().to_string();

                    // Only the topmost Received hop names the connecting client
                    if key == "received" {
                        collecting_received = first_received.is_none();
                        if collecting_received {
                            first_received = Some(value);
                        }
                        last_header_key = Some(key);
                        continue;
                    }

                    if headers.contains_key(&key) {
                        last_header_key = None;
                    } else {
                        headers.insert(key.clone(), value);
                        last_header_key = Some(key);
                    }
                }
            } else {
                body.push_str(line);
                body.push('\n');
            }
        }

        let header = |name: &str| headers.get(name).cloned().unwrap_or_default();

        let is_base64 = header("content-transfer-encoding")
            .trim()
            .eq_ignore_ascii_case("base64");
        let is_multipart = header("content-type")
            .to_lowercase()
            .starts_with("multipart/");
        if is_base64 && !is_multipart {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            match base64::engine::general_purpose::STANDARD.decode(compact.as_bytes()) {
                Ok(bytes) => body = String::from_utf8_lossy(&bytes).to_string(),
                Err(e) => log::debug!("Leaving base64 body undecoded: {e}"),
            }
        }

        let id = headers
            .get("message-id")
            .map(|v| v.trim().trim_start_matches('<').trim_end_matches('>').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback_id.to_string());

        EmailRecord {
            id,
            sender: header("from"),
            subject: header("subject"),
            date: header("date"),
            body,
            attachments: Vec::new(),
            client_ip: first_received.as_deref().and_then(client_ip_from_received),
        }
    }
}

fn client_ip_from_received(received: &str) -> Option<IpAddr> {
    let bracketed = Regex::new(r"\[(?:IPv6:)?([0-9A-Fa-f:.]+)\]").ok()?;
    let client_ip = bracketed
        .captures_iter(received)
        .find_map(|cap| cap.get(1)?.as_str().parse::<IpAddr>().ok());
    client_ip
}

/// Domain of a raw From header: everything after the last `@`, with the
/// closing `>` and surrounding whitespace removed.
pub fn sender_domain(header: &str) -> Result<String, SenderError> {
    let (_, tail) = header
        .rsplit_once('@')
        .ok_or_else(|| SenderError::MissingAt(header.to_string()))?;
    let domain = tail.trim().trim_end_matches('>').trim().to_lowercase();

    if DomainUtils::is_valid_domain(&domain) {
        Ok(domain)
    } else {
        Err(SenderError::InvalidDomain(domain))
    }
}

/// Display-name part of a `Name <addr>` header. `None` when the header is a
/// bare address or the name is blank.
pub fn display_name(header: &str) -> Result<Option<String>, SenderError> {
    let Some(open) = header.rfind('<') else {
        return Ok(None);
    };
    if !header[open..].contains('>') {
        return Err(SenderError::UnterminatedAddress(header.to_string()));
    }

    let name = header[..open].trim().trim_matches('"').trim();
    if name.is_empty() {
        Ok(None)
    } else {
        Ok(Some(name.to_string()))
    }
}
