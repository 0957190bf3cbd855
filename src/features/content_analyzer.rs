use super::{Detector, DetectorKind, DetectorResult};
use crate::config::{ContentConfig, OracleConfig};
use crate::email::EmailRecord;
use crate::oracle::{CompletionOracle, CompletionRequest, OracleError};
use async_trait::async_trait;
use std::sync::Arc;

/// Risk level the oracle stated in its free-text answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatedRisk {
    High,
    Medium,
    Low,
    Unstated,
}

impl StatedRisk {
    /// First of "high risk", "medium risk", "low risk" (in that order of
    /// precedence) found anywhere in the text, ignoring case.
    pub fn from_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("high risk") {
            StatedRisk::High
        } else if lower.contains("medium risk") {
            StatedRisk::Medium
        } else if lower.contains("low risk") {
            StatedRisk::Low
        } else {
            StatedRisk::Unstated
        }
    }

    pub fn contribution(self, config: &ContentConfig) -> u32 {
        match self {
            StatedRisk::High => config.high_risk,
            StatedRisk::Medium => config.medium_risk,
            StatedRisk::Low => config.low_risk,
            StatedRisk::Unstated => 0,
        }
    }
}

/// Narrative analysis delegated to a completion oracle.
pub struct ContentRiskAnalyzer {
    oracle: Arc<dyn CompletionOracle>,
    oracle_config: OracleConfig,
    config: ContentConfig,
}

impl ContentRiskAnalyzer {
    pub fn new(
        oracle: Arc<dyn CompletionOracle>,
        oracle_config: &OracleConfig,
        config: &ContentConfig,
    ) -> Self {
        Self {
            oracle,
            oracle_config: oracle_config.clone(),
            config: config.clone(),
        }
    }

    pub fn build_prompt(&self, email: &EmailRecord) -> String {
        let body: String = email
            .body
            .chars()
            .take(self.oracle_config.max_body_chars)
            .collect();
        let truncated = if body.len() < email.body.len() {
            "\n[body truncated]"
        } else {
            ""
        };

        format!(
            "Analyze this email for potential phishing or social engineering attempts:\n\
             \n\
             Subject: {subject}\n\
             From: {sender}\n\
             Body: {body}{truncated}\n\
             \n\
             Check for:\n\
             1. Urgency or pressure tactics\n\
             2. Requests for sensitive information\n\
             3. Unusual grammar or formatting\n\
             4. Suspicious requests or instructions\n\
             5. Mismatched sender and content\n\
             6. Social engineering patterns\n\
             \n\
             Provide a detailed analysis and risk assessment. State the overall \
             level explicitly as \"high risk\", \"medium risk\" or \"low risk\".",
            subject = email.subject,
            sender = email.sender,
        )
    }

    async fn consult(&self, email: &EmailRecord) -> Result<String, OracleError> {
        let request = CompletionRequest {
            system: self.oracle_config.system_instruction.clone(),
            prompt: self.build_prompt(email),
            temperature: self.oracle_config.temperature,
            max_tokens: self.oracle_config.max_tokens,
        };

        let timeout = self.oracle_config.timeout();
        match tokio::time::timeout(timeout, self.oracle.complete(&request)).await {
            Ok(reply) => reply,
            Err(_) => Err(OracleError::Timeout(timeout)),
        }
    }
}

#[async_trait]
impl Detector for ContentRiskAnalyzer {
    async fn inspect(&self, email: &EmailRecord) -> anyhow::Result<DetectorResult> {
        let mut result = DetectorResult::new(DetectorKind::Content);

        match self.consult(email).await {
            Ok(analysis) => {
                let stated = StatedRisk::from_text(&analysis);
                log::debug!(
                    "Oracle {} rated email {} as {stated:?}",
                    self.oracle.name(),
                    email.id
                );
                result.penalize(
                    stated.contribution(&self.config),
                    format!("Content Analysis: {analysis}"),
                );
            }
            Err(e) => {
                log::warn!("Content analysis for email {} failed: {e}", email.id);
                result.penalize(
                    self.config.error_penalty,
                    format!("Error analyzing content: {e}"),
                );
            }
        }

        Ok(result)
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::Content
    }
}
