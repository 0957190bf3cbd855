use super::{Detector, DetectorKind, DetectorResult};
use crate::config::UrlConfig;
use crate::domain_utils::DomainUtils;
use crate::email::EmailRecord;
use async_trait::async_trait;
use regex::Regex;
use url::{Host, Url};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedLink {
    pub url: String,
    pub host: Option<LinkHost>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkHost {
    Domain(String),
    Ipv4(String),
    Ipv6(String),
}

/// Scores the HTTP(S) links found in the plain-text body.
pub struct UrlRiskScanner {
    link_regex: Result<Regex, String>,
    config: UrlConfig,
}

impl UrlRiskScanner {
    pub fn new(config: &UrlConfig) -> Self {
        let link_regex = Regex::new(&config.pattern).map_err(|e| {
            log::warn!("Invalid URL pattern {:?}: {e}", config.pattern);
            e.to_string()
        });

        Self {
            link_regex,
            config: config.clone(),
        }
    }

    pub fn extract_links(&self, body: &str) -> Result<Vec<ExtractedLink>, String> {
        let regex = self.link_regex.as_ref().map_err(|e| e.clone())?;

        Ok(regex
            .find_iter(body)
            .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?', ')']))
            .filter(|url| !url.is_empty())
            .map(|url| ExtractedLink {
                url: url.to_string(),
                host: Self::parse_host(url),
            })
            .collect())
    }

    fn parse_host(url: &str) -> Option<LinkHost> {
        let Ok(parsed) = Url::parse(url) else {
            // Out-of-range octets such as 256.1.1.1 are rejected by the URL
            // parser but are still numeric hosts
            return Self::raw_authority_host(url)
                .filter(|host| Self::is_dotted_quad(host))
                .map(|host| LinkHost::Ipv4(host.to_string()));
        };
        match parsed.host()? {
            Host::Domain(domain) => Some(LinkHost::Domain(domain.to_lowercase())),
            Host::Ipv4(addr) => Some(LinkHost::Ipv4(addr.to_string())),
            Host::Ipv6(addr) => Some(LinkHost::Ipv6(addr.to_string())),
        }
    }

    /// Host part of `scheme://[userinfo@]host[:port]/...` without parsing.
    fn raw_authority_host(url: &str) -> Option<&str> {
        let (_, rest) = url.split_once("://")?;
        let authority = rest.split(['/', '?', '#']).next()?;
        let host_port = authority.rsplit('@').next()?;
        let host = host_port.split(':').next()?;
        (!host.is_empty()).then_some(host)
    }

    fn is_dotted_quad(host: &str) -> bool {
        let octets: Vec<&str> = host.split('.').collect();
        octets.len() == 4
            && octets
                .iter()
                .all(|o| (1..=3).contains(&o.len()) && o.bytes().all(|b| b.is_ascii_digit()))
    }

    fn score_link(&self, link: &ExtractedLink, result: &mut DetectorResult) {
        let Some(host) = &link.host else {
            result.note(format!("Could not parse URL, skipped: {}", link.url));
            return;
        };

        match host {
            LinkHost::Domain(domain) => {
                if DomainUtils::has_suffix(domain, &self.config.suspicious_tlds) {
                    result.penalize(
                        self.config.suspicious_tld_penalty,
                        format!("Suspicious TLD detected in URL: {}", link.url),
                    );
                }
                if DomainUtils::matches_domain_list(domain, &self.config.shorteners) {
                    result.penalize(
                        self.config.shortener_penalty,
                        format!("URL shortener detected: {}", link.url),
                    );
                }
            }
            LinkHost::Ipv4(_) => {
                result.penalize(
                    self.config.ip_host_penalty,
                    format!("IP address used in URL: {}", link.url),
                );
            }
            LinkHost::Ipv6(_) => {}
        }
    }
}

#[async_trait]
impl Detector for UrlRiskScanner {
    async fn inspect(&self, email: &EmailRecord) -> anyhow::Result<DetectorResult> {
        let mut result = DetectorResult::new(DetectorKind::Urls);

        match self.extract_links(&email.body) {
            Ok(links) => {
                log::debug!("Found {} links in email {}", links.len(), email.id);
                for link in &links {
                    self.score_link(link, &mut result);
                }
            }
            Err(e) => {
                log::warn!("URL scan of email {} failed: {e}", email.id);
                result.penalize(
                    self.config.error_penalty,
                    format!("Error analyzing URLs: {e}"),
                );
            }
        }

        Ok(result)
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::Urls
    }
}
