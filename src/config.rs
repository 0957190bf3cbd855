use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Everything the engine needs, passed explicitly into the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dns: DnsConfig,
    pub oracle: OracleConfig,
    pub authentication: AuthenticationConfig,
    pub urls: UrlConfig,
    pub sender: SenderConfig,
    pub content: ContentConfig,
    pub thresholds: RiskThresholds,
    pub store: Option<StoreConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub timeout_seconds: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self { timeout_seconds: 5 }
    }
}

impl DnsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Base URL of an OpenAI-compatible API
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub system_instruction: String,
    /// Longer bodies are cut before being sent
    pub max_body_chars: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.3,
            max_tokens: 500,
            timeout_seconds: 30,
            system_instruction:
                "You are a security expert analyzing emails for phishing attempts.".to_string(),
            max_body_chars: 8000,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticationConfig {
    pub spf_penalty: u32,
    pub dmarc_penalty: u32,
    pub error_penalty: u32,
    /// Client address used for SPF when the record carries none. Loopback
    /// addresses are treated as local submissions and pass SPF.
    pub default_client_ip: IpAddr,
    /// Deadline for the whole SPF + DMARC evaluation of one email
    pub timeout_seconds: u64,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            spf_penalty: 20,
            dmarc_penalty: 20,
            error_penalty: 30,
            default_client_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            timeout_seconds: 15,
        }
    }
}

impl AuthenticationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlConfig {
    pub pattern: String,
    pub suspicious_tlds: Vec<String>,
    pub shorteners: Vec<String>,
    pub suspicious_tld_penalty: u32,
    pub ip_host_penalty: u32,
    pub shortener_penalty: u32,
    pub error_penalty: u32,
}

impl Default for UrlConfig {
    fn default() -> Self {
        Self {
            pattern: r#"(?i)https?://[^\s<>"'`{}|\\^\[\]]+"#.to_string(),
            suspicious_tlds: [".xyz", ".tk", ".pw", ".info", ".biz"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            shorteners: [
                "bit.ly", "goo.gl", "tinyurl.com", "t.co", "ow.ly", "is.gd", "v.gd", "tiny.cc",
                "rb.gy", "cutt.ly", "shorturl.at",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            suspicious_tld_penalty: 15,
            ip_host_penalty: 20,
            shortener_penalty: 10,
            error_penalty: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Consumer mail domains that are never MX-checked
    pub common_domains: Vec<String>,
    pub spoofing_penalty: u32,
    pub no_mx_penalty: u32,
    pub error_penalty: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            common_domains: ["gmail.com", "yahoo.com", "hotmail.com", "outlook.com"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            spoofing_penalty: 15,
            no_mx_penalty: 20,
            error_penalty: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub high_risk: u32,
    pub medium_risk: u32,
    pub low_risk: u32,
    pub error_penalty: u32,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            high_risk: 40,
            medium_risk: 20,
            low_risk: 10,
            error_penalty: 30,
        }
    }
}

/// Inclusive lower bounds of each risk band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            critical: 80,
            high: 60,
            medium: 40,
            low: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub directory: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl EngineConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.authentication.spf_penalty, 20);
        assert_eq!(config.urls.ip_host_penalty, 20);
        assert_eq!(config.sender.common_domains.len(), 4);
        assert_eq!(config.content.high_risk, 40);
        assert_eq!(config.thresholds.critical, 80);
        assert_eq!(config.oracle.api_key_env, "OPENAI_API_KEY");
        assert!(config.store.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
thresholds:
  critical: 90
urls:
  suspicious_tlds: [".zip"]
store:
  directory: /var/lib/phishguard
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.thresholds.critical, 90);
        assert_eq!(config.thresholds.high, 60);
        assert_eq!(config.urls.suspicious_tlds, vec![".zip".to_string()]);
        assert_eq!(config.urls.shortener_penalty, 10);
        assert_eq!(config.store.unwrap().directory, "/var/lib/phishguard");
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phishguard.yaml");
        let path = path.to_str().unwrap();

        let mut config = EngineConfig::default();
        config.authentication.default_client_ip = "192.0.2.1".parse().unwrap();
        config.to_file(path).unwrap();

        assert_eq!(EngineConfig::from_file(path).unwrap(), config);
    }
}
