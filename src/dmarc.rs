use crate::dns::{DnsError, MailDns};
use crate::domain_utils::DomainUtils;
use crate::spf::SpfResult;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmarcPolicy {
    None,
    Quarantine,
    Reject,
}

impl DmarcPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "none" => Some(DmarcPolicy::None),
            "quarantine" => Some(DmarcPolicy::Quarantine),
            "reject" => Some(DmarcPolicy::Reject),
            _ => None,
        }
    }
}

impl fmt::Display for DmarcPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DmarcPolicy::None => "none",
            DmarcPolicy::Quarantine => "quarantine",
            DmarcPolicy::Reject => "reject",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcRecord {
    pub policy: DmarcPolicy,
    pub subdomain_policy: Option<DmarcPolicy>,
    pub percent: u8,
    pub strict_spf: bool,
    pub strict_dkim: bool,
    pub report_uris: Vec<String>,
}

impl DmarcRecord {
    pub fn parse(record: &str) -> Result<Self, String> {
        let mut tags = record
            .split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((k, v)) => (k.trim().to_lowercase(), v.trim().to_string()),
                None => (part.to_lowercase(), String::new()),
            });

        match tags.next() {
            Some((k, v)) if k == "v" && v.eq_ignore_ascii_case("DMARC1") => {}
            _ => return Err("record does not start with v=DMARC1".to_string()),
        }

        let mut policy = None;
        let mut parsed = DmarcRecord {
            policy: DmarcPolicy::None,
            subdomain_policy: None,
            percent: 100,
            strict_spf: false,
            strict_dkim: false,
            report_uris: Vec::new(),
        };

        for (tag, value) in tags {
            match tag.as_str() {
                "p" => {
                    policy = Some(
                        DmarcPolicy::parse(&value)
                            .ok_or_else(|| format!("invalid policy {value:?}"))?,
                    )
                }
                "sp" => parsed.subdomain_policy = DmarcPolicy::parse(&value),
                "pct" => parsed.percent = value.parse::<u8>().unwrap_or(100).min(100),
                "aspf" => parsed.strict_spf = value.eq_ignore_ascii_case("s"),
                "adkim" => parsed.strict_dkim = value.eq_ignore_ascii_case("s"),
                "rua" => {
                    parsed.report_uris = value.split(',').map(|u| u.trim().to_string()).collect()
                }
                _ => {}
            }
        }

        parsed.policy = policy.ok_or("missing required p= tag")?;
        Ok(parsed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmarcStatus {
    Pass,
    Fail(DmarcPolicy),
    None,
    PermError(String),
}

impl fmt::Display for DmarcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmarcStatus::Pass => f.write_str("pass"),
            DmarcStatus::Fail(policy) => write!(f, "fail (p={policy})"),
            DmarcStatus::None => f.write_str("none"),
            DmarcStatus::PermError(reason) => write!(f, "permerror ({reason})"),
        }
    }
}

pub struct DmarcVerifier;

impl DmarcVerifier {
    /// Look up the published record for `domain`, falling back to the
    /// organizational domain. NXDOMAIN on `_dmarc.` names means no record.
    pub async fn lookup(
        dns: &dyn MailDns,
        domain: &str,
    ) -> Result<Option<Result<DmarcRecord, String>>, DnsError> {
        let org_domain = DomainUtils::organizational_domain(domain);
        let mut candidates = vec![domain.to_lowercase()];
        if org_domain != candidates[0] {
            candidates.push(org_domain);
        }

        for candidate in candidates {
            let name = format!("_dmarc.{candidate}");
            let records = match dns.txt_records(&name).await {
                Ok(records) => records,
                Err(DnsError::NotFound(_)) => Vec::new(),
                Err(e) => return Err(e),
            };

            let dmarc: Vec<&String> = records
                .iter()
                .filter(|r| r.trim_start().to_lowercase().starts_with("v=dmarc1"))
                .collect();

            match dmarc.len() {
                0 => continue,
                1 => {
                    log::debug!("DMARC record for {domain} found at {name}: {}", dmarc[0]);
                    return Ok(Some(DmarcRecord::parse(dmarc[0])));
                }
                _ => return Ok(Some(Err(format!("multiple DMARC records at {name}")))),
            }
        }

        Ok(None)
    }

    /// DMARC outcome for a message whose only authentication signal is SPF
    /// evaluated on the From domain itself, which is aligned by construction.
    pub async fn verify(
        dns: &dyn MailDns,
        domain: &str,
        spf: SpfResult,
    ) -> Result<DmarcStatus, DnsError> {
        let status = match Self::lookup(dns, domain).await? {
            None => DmarcStatus::None,
            Some(Err(reason)) => DmarcStatus::PermError(reason),
            Some(Ok(record)) => {
                if spf == SpfResult::Pass {
                    DmarcStatus::Pass
                } else {
                    let org_domain = DomainUtils::organizational_domain(domain);
                    let policy = if domain != org_domain {
                        record.subdomain_policy.unwrap_or(record.policy)
                    } else {
                        record.policy
                    };
                    DmarcStatus::Fail(policy)
                }
            }
        };

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticDns;

    #[test]
    fn test_record_parsing() {
        let record = DmarcRecord::parse(
            "v=DMARC1; p=reject; sp=quarantine; pct=50; aspf=s; rua=mailto:a@example.com",
        )
        .unwrap();
        assert_eq!(record.policy, DmarcPolicy::Reject);
        assert_eq!(record.subdomain_policy, Some(DmarcPolicy::Quarantine));
        assert_eq!(record.percent, 50);
        assert!(record.strict_spf);
        assert!(!record.strict_dkim);
        assert_eq!(record.report_uris, vec!["mailto:a@example.com".to_string()]);
    }

    #[test]
    fn test_record_parsing_errors() {
        assert!(DmarcRecord::parse("p=reject; v=DMARC1").is_err());
        assert!(DmarcRecord::parse("v=DMARC1; rua=mailto:x@example.com").is_err());
        assert!(DmarcRecord::parse("v=DMARC1; p=maybe").is_err());
    }

    #[tokio::test]
    async fn test_verify_statuses() {
        let dns = StaticDns::new()
            .with_txt("_dmarc.example.com", "v=DMARC1; p=reject")
            .with_txt("_dmarc.twice.test", "v=DMARC1; p=none")
            .with_txt("_dmarc.twice.test", "v=DMARC1; p=reject");

        assert_eq!(
            DmarcVerifier::verify(&dns, "example.com", SpfResult::Pass).await,
            Ok(DmarcStatus::Pass)
        );
        assert_eq!(
            DmarcVerifier::verify(&dns, "example.com", SpfResult::SoftFail).await,
            Ok(DmarcStatus::Fail(DmarcPolicy::Reject))
        );
        assert_eq!(
            DmarcVerifier::verify(&dns, "nodmarc.test", SpfResult::Pass).await,
            Ok(DmarcStatus::None)
        );
        assert!(matches!(
            DmarcVerifier::verify(&dns, "twice.test", SpfResult::Pass).await,
            Ok(DmarcStatus::PermError(_))
        ));
    }

    #[tokio::test]
    async fn test_organizational_fallback() {
        let dns = StaticDns::new()
            .with_txt("_dmarc.example.com", "v=DMARC1; p=none; sp=quarantine");

        assert_eq!(
            DmarcVerifier::verify(&dns, "mail.example.com", SpfResult::Fail).await,
            Ok(DmarcStatus::Fail(DmarcPolicy::Quarantine))
        );
    }

    #[tokio::test]
    async fn test_lookup_timeout_is_error() {
        let dns = StaticDns::new().with_timeout("_dmarc.example.com");

        assert_eq!(
            DmarcVerifier::verify(&dns, "example.com", SpfResult::Pass).await,
            Err(DnsError::Timeout("_dmarc.example.com".to_string()))
        );
    }
}
