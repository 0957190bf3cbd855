use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::TokioAsyncResolver;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    #[error("domain {0} does not exist (NXDOMAIN)")]
    NotFound(String),
    #[error("DNS lookup for {0} timed out")]
    Timeout(String),
    #[error("DNS lookup for {name} failed: {reason}")]
    Resolver { name: String, reason: String },
}

/// The record lookups the detectors need. An existing name without records
/// of the requested type answers `Ok(vec![])`.
#[async_trait]
pub trait MailDns: Send + Sync {
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, DnsError>;
    /// MX exchange host names, trailing dot removed
    async fn mx_hosts(&self, domain: &str) -> Result<Vec<String>, DnsError>;
    async fn ip_addrs(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

pub struct HickoryDns {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryDns {
    /// Resolver from the system configuration, one attempt per query.
    pub fn from_system_conf(timeout: Duration) -> Self {
        let (config, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                log::warn!("Failed to read system DNS configuration, using defaults: {e}");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        opts.timeout = timeout;
        opts.attempts = 1;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            timeout,
        }
    }
}

fn fqdn(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

fn classify<T>(name: &str, err: ResolveError) -> Result<Vec<T>, DnsError> {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. }
            if *response_code == ResponseCode::NXDomain =>
        {
            Err(DnsError::NotFound(name.to_string()))
        }
        ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
        ResolveErrorKind::Timeout => Err(DnsError::Timeout(name.to_string())),
        _ => Err(DnsError::Resolver {
            name: name.to_string(),
            reason: err.to_string(),
        }),
    }
}

#[async_trait]
impl MailDns for HickoryDns {
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, DnsError> {
        log::debug!("Looking up TXT records for {name}");
        let query = fqdn(name);

        match tokio::time::timeout(self.timeout, self.resolver.txt_lookup(query.as_str())).await {
            Ok(Ok(lookup)) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect::<String>()
                })
                .collect()),
            Ok(Err(e)) => classify(name, e),
            Err(_) => Err(DnsError::Timeout(name.to_string())),
        }
    }

    async fn mx_hosts(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        log::debug!("Checking MX records for {domain}");
        let query = fqdn(domain);

        match tokio::time::timeout(self.timeout, self.resolver.mx_lookup(query.as_str())).await {
            Ok(Ok(lookup)) => {
                let hosts: Vec<String> = lookup
                    .iter()
                    .map(|mx| {
                        log::debug!(
                            "MX record for {domain}: {} (priority {})",
                            mx.exchange(),
                            mx.preference()
                        );
                        mx.exchange().to_utf8().trim_end_matches('.').to_string()
                    })
                    .collect();
                Ok(hosts)
            }
            Ok(Err(e)) => classify(domain, e),
            Err(_) => Err(DnsError::Timeout(domain.to_string())),
        }
    }

    async fn ip_addrs(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        log::debug!("Checking A/AAAA records for {host}");
        let query = fqdn(host);

        match tokio::time::timeout(self.timeout, self.resolver.lookup_ip(query.as_str())).await {
            Ok(Ok(lookup)) => Ok(lookup.iter().collect()),
            Ok(Err(e)) => classify(host, e),
            Err(_) => Err(DnsError::Timeout(host.to_string())),
        }
    }
}

/// In-memory zone for tests and offline runs. Names never mentioned answer
/// NXDOMAIN.
#[derive(Debug, Clone, Default)]
pub struct StaticDns {
    known: HashSet<String>,
    txt: HashMap<String, Vec<String>>,
    mx: HashMap<String, Vec<String>>,
    ips: HashMap<String, Vec<IpAddr>>,
    failures: HashMap<String, DnsError>,
    delay: Option<Duration>,
}

fn key(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

impl StaticDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_txt(mut self, name: &str, record: &str) -> Self {
        self.known.insert(key(name));
        self.txt
            .entry(key(name))
            .or_default()
            .push(record.to_string());
        self
    }

    pub fn with_mx(mut self, domain: &str, host: &str) -> Self {
        self.known.insert(key(domain));
        self.mx.entry(key(domain)).or_default().push(key(host));
        self
    }

    pub fn with_ip(mut self, host: &str, ip: IpAddr) -> Self {
        self.known.insert(key(host));
        self.ips.entry(key(host)).or_default().push(ip);
        self
    }

    /// Every lookup of `name` fails with a timeout.
    pub fn with_timeout(mut self, name: &str) -> Self {
        self.failures
            .insert(key(name), DnsError::Timeout(key(name)));
        self
    }

    /// Sleep before every answer, to exercise caller-side deadlines.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn answer<T: Clone>(
        &self,
        name: &str,
        table: &HashMap<String, Vec<T>>,
    ) -> Result<Vec<T>, DnsError> {
        let name = key(name);
        if let Some(failure) = self.failures.get(&name) {
            return Err(failure.clone());
        }
        if !self.known.contains(&name) {
            return Err(DnsError::NotFound(name));
        }
        Ok(table.get(&name).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl MailDns for StaticDns {
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.pause().await;
        self.answer(name, &self.txt)
    }

    async fn mx_hosts(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        self.pause().await;
        self.answer(domain, &self.mx)
    }

    async fn ip_addrs(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.pause().await;
        self.answer(host, &self.ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fqdn() {
        assert_eq!(fqdn("example.com"), "example.com.");
        assert_eq!(fqdn("example.com."), "example.com.");
    }

    #[tokio::test]
    async fn test_static_dns_answers() {
        let dns = StaticDns::new()
            .with_txt("example.com", "v=spf1 -all")
            .with_mx("Example.com.", "mx1.example.com")
            .with_timeout("slow.test");

        assert_eq!(
            dns.txt_records("example.com").await.unwrap(),
            vec!["v=spf1 -all".to_string()]
        );
        assert_eq!(
            dns.mx_hosts("example.com").await.unwrap(),
            vec!["mx1.example.com".to_string()]
        );
        // Known name without A records
        assert!(dns.ip_addrs("example.com").await.unwrap().is_empty());
        assert_eq!(
            dns.txt_records("missing.test").await,
            Err(DnsError::NotFound("missing.test".to_string()))
        );
        assert_eq!(
            dns.mx_hosts("slow.test").await,
            Err(DnsError::Timeout("slow.test".to_string()))
        );
    }
}
