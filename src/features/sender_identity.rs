use super::{Detector, DetectorKind, DetectorResult};
use crate::config::SenderConfig;
use crate::dns::{DnsError, MailDns};
use crate::email::{display_name, sender_domain, EmailRecord, SenderError};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
enum SenderCheckError {
    #[error(transparent)]
    Header(#[from] SenderError),
    #[error(transparent)]
    Dns(#[from] DnsError),
}

/// Display-name spoofing and unverifiable sender domains.
pub struct SenderIdentityAnalyzer {
    dns: Arc<dyn MailDns>,
    config: SenderConfig,
}

impl SenderIdentityAnalyzer {
    pub fn new(dns: Arc<dyn MailDns>, config: &SenderConfig) -> Self {
        Self {
            dns,
            config: config.clone(),
        }
    }

    /// A display name that itself looks like an address, e.g.
    /// `user@bank.com <attacker@evil.com>`.
    pub fn is_display_name_spoofed(header: &str) -> Result<bool, SenderError> {
        Ok(display_name(header)?.is_some_and(|name| name.contains('@')))
    }

    fn is_common_domain(&self, domain: &str) -> bool {
        self.config
            .common_domains
            .iter()
            .any(|common| common.eq_ignore_ascii_case(domain))
    }

    async fn evaluate(
        &self,
        email: &EmailRecord,
        result: &mut DetectorResult,
    ) -> Result<(), SenderCheckError> {
        if Self::is_display_name_spoofed(&email.sender)? {
            result.penalize(
                self.config.spoofing_penalty,
                "Potential display name spoofing detected",
            );
        }

        let domain = sender_domain(&email.sender)?;
        if self.is_common_domain(&domain) {
            return Ok(());
        }

        let has_mx = match self.dns.mx_hosts(&domain).await {
            Ok(hosts) => !hosts.is_empty(),
            Err(DnsError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };
        if !has_mx {
            result.penalize(
                self.config.no_mx_penalty,
                format!("Sender domain {domain} has no MX records"),
            );
        }

        Ok(())
    }
}

#[async_trait]
impl Detector for SenderIdentityAnalyzer {
    async fn inspect(&self, email: &EmailRecord) -> anyhow::Result<DetectorResult> {
        let mut result = DetectorResult::new(DetectorKind::Sender);

        if let Err(e) = self.evaluate(email, &mut result).await {
            log::warn!("Sender analysis for email {} failed: {e}", email.id);
            result.penalize(
                self.config.error_penalty,
                format!("Error analyzing sender: {e}"),
            );
        }

        Ok(result)
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::Sender
    }
}
