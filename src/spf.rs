//! Sender Policy Framework evaluation (RFC 7208 subset).
//!
//! Supports the `all`, `ip4`, `ip6`, `a`, `mx`, `include`, `exists` and `ptr`
//! mechanisms plus the `redirect` modifier. Macro expansion is not supported
//! and yields a permerror.

use crate::dns::{DnsError, MailDns};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::net::IpAddr;

/// Upper bound on DNS-querying terms per evaluation (RFC 7208 4.6.4)
const MAX_DNS_TERMS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        };
        f.write_str(text)
    }
}

impl SpfResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, SpfResult::Pass)
    }
}

fn qualifier_result(qualifier: char) -> SpfResult {
    match qualifier {
        '-' => SpfResult::Fail,
        '~' => SpfResult::SoftFail,
        '?' => SpfResult::Neutral,
        _ => SpfResult::Pass,
    }
}

/// Pick the single `v=spf1` record out of a TXT answer.
fn select_policy(records: &[String]) -> Result<Option<&str>, SpfResult> {
    let policies: Vec<&str> = records
        .iter()
        .map(|r| r.trim())
        .filter(|r| {
            let lower = r.to_lowercase();
            lower == "v=spf1" || lower.starts_with("v=spf1 ")
        })
        .collect();

    match policies.len() {
        0 => Ok(None),
        1 => Ok(Some(policies[0])),
        _ => Err(SpfResult::PermError),
    }
}

fn ip_in_network(ip: IpAddr, network: IpAddr, prefix: u8) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let prefix = prefix.min(32) as u32;
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            (u32::from(ip) & mask) == (u32::from(net) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let prefix = prefix.min(128) as u32;
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            (u128::from(ip) & mask) == (u128::from(net) & mask)
        }
        _ => false,
    }
}

/// Split `domain/cidr4//cidr6` into its parts.
fn split_cidr(domain_spec: &str) -> Result<(&str, u8, u8), SpfResult> {
    let (rest, cidr6) = match domain_spec.split_once("//") {
        Some((rest, v6)) => (rest, v6.parse::<u8>().map_err(|_| SpfResult::PermError)?),
        None => (domain_spec, 128),
    };
    let (domain, cidr4) = match rest.split_once('/') {
        Some((domain, v4)) => (domain, v4.parse::<u8>().map_err(|_| SpfResult::PermError)?),
        None => (rest, 32),
    };
    if cidr4 > 32 || cidr6 > 128 {
        return Err(SpfResult::PermError);
    }
    Ok((domain, cidr4, cidr6))
}

pub struct SpfEvaluator<'a> {
    dns: &'a dyn MailDns,
    client_ip: IpAddr,
}

impl<'a> SpfEvaluator<'a> {
    pub fn new(dns: &'a dyn MailDns, client_ip: IpAddr) -> Self {
        Self { dns, client_ip }
    }

    /// Evaluate `domain`'s policy for the client IP. A lookup failure of the
    /// domain's own policy is returned as an error; failures further down the
    /// include chain become `TempError`.
    ///
    /// Loopback clients are local submissions and always pass without a
    /// lookup.
    pub async fn check_host(&self, domain: &str) -> Result<SpfResult, DnsError> {
        if self.client_ip.is_loopback() {
            log::debug!("SPF for {domain}: local client {} passes", self.client_ip);
            return Ok(SpfResult::Pass);
        }

        let records = self.dns.txt_records(domain).await?;
        let mut dns_terms = 0;
        let result = match select_policy(&records) {
            Ok(Some(policy)) => {
                let policy = policy.to_string();
                self.evaluate_policy(domain, &policy, &mut dns_terms).await
            }
            Ok(None) => SpfResult::None,
            Err(result) => result,
        };
        log::debug!("SPF for {domain} from {}: {result}", self.client_ip);
        Ok(result)
    }

    fn check_nested<'b>(
        &'b self,
        domain: &'b str,
        dns_terms: &'b mut usize,
    ) -> BoxFuture<'b, SpfResult> {
        async move {
            let records = match self.dns.txt_records(domain).await {
                Ok(records) => records,
                Err(DnsError::NotFound(_)) => return SpfResult::None,
                Err(e) => {
                    log::debug!("SPF lookup inside include chain failed: {e}");
                    return SpfResult::TempError;
                }
            };
            match select_policy(&records) {
                Ok(Some(policy)) => {
                    let policy = policy.to_string();
                    self.evaluate_policy(domain, &policy, dns_terms).await
                }
                Ok(None) => SpfResult::None,
                Err(result) => result,
            }
        }
        .boxed()
    }

    fn evaluate_policy<'b>(
        &'b self,
        domain: &'b str,
        policy: &'b str,
        dns_terms: &'b mut usize,
    ) -> BoxFuture<'b, SpfResult> {
        async move {
            let mut redirect: Option<String> = None;

            for term in policy.split_whitespace().skip(1) {
                if term.contains('%') {
                    return SpfResult::PermError;
                }

                let lower = term.to_lowercase();
                if let Some(target) = lower.strip_prefix("redirect=") {
                    redirect = Some(target.to_string());
                    continue;
                }
                if lower.contains('=') {
                    // exp= and unknown modifiers carry no verdict
                    continue;
                }

                let (qualifier, mechanism) = match lower.chars().next() {
                    Some(c @ ('+' | '-' | '~' | '?')) => (c, &lower[1..]),
                    _ => ('+', lower.as_str()),
                };

                match self.mechanism_matches(domain, mechanism, dns_terms).await {
                    Ok(true) => return qualifier_result(qualifier),
                    Ok(false) => {}
                    Err(result) => return result,
                }
            }

            if let Some(target) = redirect {
                *dns_terms += 1;
                if *dns_terms > MAX_DNS_TERMS {
                    return SpfResult::PermError;
                }
                return match self.check_nested(&target, dns_terms).await {
                    SpfResult::None => SpfResult::PermError,
                    result => result,
                };
            }

            SpfResult::Neutral
        }
        .boxed()
    }

    async fn mechanism_matches(
        &self,
        domain: &str,
        mechanism: &str,
        dns_terms: &mut usize,
    ) -> Result<bool, SpfResult> {
        let (name, arg) = match mechanism.find([':', '/']) {
            Some(pos) if mechanism.as_bytes()[pos] == b':' => {
                (&mechanism[..pos], Some(&mechanism[pos + 1..]))
            }
            Some(pos) => (&mechanism[..pos], Some(&mechanism[pos..])),
            None => (mechanism, None),
        };

        if matches!(name, "include" | "a" | "mx" | "ptr" | "exists") {
            *dns_terms += 1;
            if *dns_terms > MAX_DNS_TERMS {
                return Err(SpfResult::PermError);
            }
        }

        match name {
            "all" => Ok(true),
            "ip4" | "ip6" => {
                let arg = arg.ok_or(SpfResult::PermError)?;
                let (net, prefix) = match arg.split_once('/') {
                    Some((net, len)) => (net, Some(len)),
                    None => (arg, None),
                };
                let network: IpAddr = net.parse().map_err(|_| SpfResult::PermError)?;
                let max_prefix = if network.is_ipv4() { 32 } else { 128 };
                let prefix = match prefix {
                    Some(len) => len.parse::<u8>().map_err(|_| SpfResult::PermError)?,
                    None => max_prefix,
                };
                if prefix > max_prefix || (name == "ip4") != network.is_ipv4() {
                    return Err(SpfResult::PermError);
                }
                Ok(ip_in_network(self.client_ip, network, prefix))
            }
            "a" | "mx" => {
                let domain_spec = match arg {
                    Some(rest) if rest.starts_with('/') => format!("{domain}{rest}"),
                    Some(rest) => rest.to_string(),
                    None => domain.to_string(),
                };
                let (target, cidr4, cidr6) = split_cidr(&domain_spec)?;
                let hosts = if name == "mx" {
                    self.lookup(self.dns.mx_hosts(target).await)?
                } else {
                    vec![target.to_string()]
                };

                for host in hosts.iter().take(MAX_DNS_TERMS) {
                    let addrs = self.lookup(self.dns.ip_addrs(host).await)?;
                    let hit = addrs.into_iter().any(|addr| {
                        let prefix = if addr.is_ipv4() { cidr4 } else { cidr6 };
                        ip_in_network(self.client_ip, addr, prefix)
                    });
                    if hit {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            "include" => {
                let target = arg.ok_or(SpfResult::PermError)?;
                match self.check_nested(target, dns_terms).await {
                    SpfResult::Pass => Ok(true),
                    SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => Ok(false),
                    SpfResult::TempError => Err(SpfResult::TempError),
                    SpfResult::None | SpfResult::PermError => Err(SpfResult::PermError),
                }
            }
            "exists" => {
                let target = arg.ok_or(SpfResult::PermError)?;
                let addrs = self.lookup(self.dns.ip_addrs(target).await)?;
                Ok(addrs.iter().any(|addr| addr.is_ipv4()))
            }
            // Deprecated; never trusted here
            "ptr" => Ok(false),
            _ => Err(SpfResult::PermError),
        }
    }

    /// NXDOMAIN inside a mechanism is a non-match, anything else a temperror.
    fn lookup<T>(&self, answer: Result<Vec<T>, DnsError>) -> Result<Vec<T>, SpfResult> {
        match answer {
            Ok(values) => Ok(values),
            Err(DnsError::NotFound(_)) => Ok(Vec::new()),
            Err(_) => Err(SpfResult::TempError),
        }
    }
}
