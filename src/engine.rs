use crate::config::{EngineConfig, RiskThresholds};
use crate::dns::MailDns;
use crate::email::EmailRecord;
use crate::features::{
    AuthenticationSignalChecker, ContentRiskAnalyzer, Detector, DetectorKind, DetectorResult,
    Finding, SenderIdentityAnalyzer, UrlRiskScanner,
};
use crate::oracle::CompletionOracle;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

pub const MAX_RISK_SCORE: u32 = 100;

/// Ordered from least to most severe; a failed analysis ranks above
/// everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
    /// Analysis itself failed; the score is forced to the maximum
    Error,
}

impl RiskLevel {
    /// Inclusive lower bounds, checked from the top band down.
    pub fn from_score(score: u32, thresholds: &RiskThresholds) -> Self {
        match score {
            s if s >= thresholds.critical => RiskLevel::Critical,
            s if s >= thresholds.high => RiskLevel::High,
            s if s >= thresholds.medium => RiskLevel::Medium,
            s if s >= thresholds.low => RiskLevel::Low,
            _ => RiskLevel::Safe,
        }
    }

    pub fn recommendation(self) -> &'static str {
        match self {
            RiskLevel::Critical => "DO NOT OPEN - This email shows strong signs of being malicious.",
            RiskLevel::High => "HIGHLY SUSPICIOUS - Exercise extreme caution and verify sender.",
            RiskLevel::Medium => "SUSPICIOUS - Review carefully before taking any action.",
            RiskLevel::Low => "LOW RISK - Proceed with normal caution.",
            RiskLevel::Safe => "SAFE - No significant risks detected.",
            RiskLevel::Error => "Unable to analyze email due to an error.",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
            RiskLevel::Error => "ERROR",
        })
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SAFE" => Ok(RiskLevel::Safe),
            "LOW" => Ok(RiskLevel::Low),
            "MEDIUM" => Ok(RiskLevel::Medium),
            "HIGH" => Ok(RiskLevel::High),
            "CRITICAL" => Ok(RiskLevel::Critical),
            "ERROR" => Ok(RiskLevel::Error),
            other => Err(format!("unknown risk level {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub findings: Vec<Finding>,
    pub recommendation: String,
}

impl RiskVerdict {
    pub fn from_results(results: Vec<DetectorResult>, thresholds: &RiskThresholds) -> Self {
        let total = results
            .iter()
            .fold(0u32, |acc, r| acc.saturating_add(r.risk_contribution));
        let risk_score = total.min(MAX_RISK_SCORE);
        let risk_level = RiskLevel::from_score(risk_score, thresholds);

        Self {
            risk_score,
            risk_level,
            findings: results.into_iter().flat_map(|r| r.findings).collect(),
            recommendation: risk_level.recommendation().to_string(),
        }
    }

    /// The fail-unsafe verdict: maximum score, one diagnostic finding.
    pub fn failed(reason: impl fmt::Display) -> Self {
        Self {
            risk_score: MAX_RISK_SCORE,
            risk_level: RiskLevel::Error,
            findings: vec![Finding {
                detector: DetectorKind::Engine,
                message: format!("Error during analysis: {reason}"),
            }],
            recommendation: RiskLevel::Error.recommendation().to_string(),
        }
    }
}

/// Runs every detector over an email and folds the results into a verdict.
pub struct RiskAggregator {
    detectors: Vec<Box<dyn Detector>>,
    thresholds: RiskThresholds,
}

impl RiskAggregator {
    pub fn new(
        config: &EngineConfig,
        dns: Arc<dyn MailDns>,
        oracle: Arc<dyn CompletionOracle>,
    ) -> Self {
        Self::with_detectors(
            config.thresholds.clone(),
            vec![
                Box::new(AuthenticationSignalChecker::new(
                    dns.clone(),
                    &config.authentication,
                )),
                Box::new(ContentRiskAnalyzer::new(
                    oracle,
                    &config.oracle,
                    &config.content,
                )),
                Box::new(UrlRiskScanner::new(&config.urls)),
                Box::new(SenderIdentityAnalyzer::new(dns, &config.sender)),
            ],
        )
    }

    pub fn with_detectors(thresholds: RiskThresholds, detectors: Vec<Box<dyn Detector>>) -> Self {
        Self {
            detectors,
            thresholds,
        }
    }

    pub fn detector_kinds(&self) -> Vec<DetectorKind> {
        self.detectors.iter().map(|d| d.kind()).collect()
    }

    pub async fn analyze(&self, email: &EmailRecord) -> RiskVerdict {
        let mut results = Vec::with_capacity(self.detectors.len());

        for detector in &self.detectors {
            let outcome = AssertUnwindSafe(detector.inspect(email))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(result)) => {
                    log::debug!(
                        "Detector {} contributed {} to email {}",
                        result.detector,
                        result.risk_contribution,
                        email.id
                    );
                    results.push(result);
                }
                Ok(Err(e)) => {
                    log::error!(
                        "Detector {} failed on email {}: {e:#}",
                        detector.kind(),
                        email.id
                    );
                    return RiskVerdict::failed(e);
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    log::error!(
                        "Detector {} panicked on email {}: {reason}",
                        detector.kind(),
                        email.id
                    );
                    return RiskVerdict::failed(reason);
                }
            }
        }

        let verdict = RiskVerdict::from_results(results, &self.thresholds);
        log::info!(
            "Email {} scored {} ({}) with {} findings",
            email.id,
            verdict.risk_score,
            verdict.risk_level,
            verdict.findings.len()
        );
        verdict
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "detector panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticDns;
    use crate::oracle::{OracleError, StaticOracle};
    use async_trait::async_trait;

    struct Fixed(DetectorKind, u32);

    #[async_trait]
    impl Detector for Fixed {
        async fn inspect(&self, _email: &EmailRecord) -> anyhow::Result<DetectorResult> {
            let mut result = DetectorResult::new(self.0);
            if self.1 > 0 {
                result.penalize(self.1, format!("fixed {}", self.1));
            }
            Ok(result)
        }

        fn kind(&self) -> DetectorKind {
            self.0
        }
    }

    struct Failing;

    #[async_trait]
    impl Detector for Failing {
        async fn inspect(&self, _email: &EmailRecord) -> anyhow::Result<DetectorResult> {
            anyhow::bail!("resolver state corrupted")
        }

        fn kind(&self) -> DetectorKind {
            DetectorKind::Sender
        }
    }

    struct Panicking;

    #[async_trait]
    impl Detector for Panicking {
        async fn inspect(&self, _email: &EmailRecord) -> anyhow::Result<DetectorResult> {
            panic!("index out of range")
        }

        fn kind(&self) -> DetectorKind {
            DetectorKind::Urls
        }
    }

    fn email() -> EmailRecord {
        EmailRecord {
            id: "engine-1".to_string(),
            sender: "Alice <alice@example.com>".to_string(),
            subject: "Lunch".to_string(),
            date: "Mon, 19 Oct 2026 10:00:00 +0000".to_string(),
            body: "See you at noon.".to_string(),
            attachments: Vec::new(),
            client_ip: Some("192.0.2.10".parse().unwrap()),
        }
    }

    /// A zone under which the authentication and sender detectors are clean.
    fn clean_dns() -> StaticDns {
        StaticDns::new()
            .with_txt("example.com", "v=spf1 ip4:192.0.2.0/24 -all")
            .with_txt("_dmarc.example.com", "v=DMARC1; p=reject")
            .with_mx("example.com", "mx.example.com")
    }

    fn aggregator(oracle: StaticOracle) -> RiskAggregator {
        RiskAggregator::new(
            &EngineConfig::default(),
            Arc::new(clean_dns()),
            Arc::new(oracle),
        )
    }

    fn fixed(points: &[u32]) -> Vec<Box<dyn Detector>> {
        points
            .iter()
            .map(|p| Box::new(Fixed(DetectorKind::Content, *p)) as Box<dyn Detector>)
            .collect()
    }

    #[test]
    fn test_level_bands() {
        let t = RiskThresholds::default();
        assert_eq!(RiskLevel::from_score(0, &t), RiskLevel::Safe);
        assert_eq!(RiskLevel::from_score(19, &t), RiskLevel::Safe);
        assert_eq!(RiskLevel::from_score(20, &t), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(40, &t), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(59, &t), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(60, &t), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(80, &t), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(100, &t), RiskLevel::Critical);
    }

    #[test]
    fn test_level_serializes_uppercase() {
        let json = serde_json::to_string(&RiskLevel::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
        assert_eq!(RiskLevel::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_level_order_and_parsing() {
        assert!(RiskLevel::Safe < RiskLevel::Low);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert!(RiskLevel::Critical < RiskLevel::Error);
        assert_eq!("high".parse::<RiskLevel>(), Ok(RiskLevel::High));
        assert_eq!(" Critical ".parse::<RiskLevel>(), Ok(RiskLevel::Critical));
        assert!("severe".parse::<RiskLevel>().is_err());
    }

    #[test]
    fn test_failed_verdict_shape() {
        let verdict = RiskVerdict::failed("boom");
        assert_eq!(verdict.risk_score, 100);
        assert_eq!(verdict.risk_level, RiskLevel::Error);
        assert_eq!(verdict.findings.len(), 1);
        assert_eq!(verdict.findings[0].detector, DetectorKind::Engine);
        assert_eq!(
            verdict.recommendation,
            "Unable to analyze email due to an error."
        );
    }

    #[tokio::test]
    async fn test_all_zero_is_safe() {
        let verdict = aggregator(StaticOracle::replying("Nothing suspicious here."))
            .analyze(&email())
            .await;

        assert_eq!(verdict.risk_score, 0);
        assert_eq!(verdict.risk_level, RiskLevel::Safe);
        assert_eq!(verdict.recommendation, "SAFE - No significant risks detected.");
        // Only the oracle's narrative is recorded
        assert_eq!(verdict.findings.len(), 1);
    }

    #[tokio::test]
    async fn test_json_record_without_client_ip_is_safe() {
        let email = EmailRecord::from_json(
            r#"{
                "id": "json-1",
                "sender": "Alice <alice@example.com>",
                "subject": "Lunch",
                "date": "Mon, 19 Oct 2026 10:00:00 +0000",
                "body": "See you at noon."
            }"#,
        )
        .unwrap();
        assert_eq!(email.client_ip, None);

        let verdict = aggregator(StaticOracle::replying("Nothing suspicious."))
            .analyze(&email)
            .await;

        assert_eq!(verdict.risk_score, 0);
        assert_eq!(verdict.risk_level, RiskLevel::Safe);
        assert!(verdict
            .findings
            .iter()
            .all(|f| f.detector != DetectorKind::Authentication));
    }

    #[tokio::test]
    async fn test_high_risk_content_alone_is_medium() {
        let verdict = aggregator(StaticOracle::replying("Overall this is high risk."))
            .analyze(&email())
            .await;

        assert_eq!(verdict.risk_score, 40);
        assert_eq!(verdict.risk_level, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn test_oracle_failure_is_not_an_error_verdict() {
        let oracle = StaticOracle::failing(OracleError::Timeout(std::time::Duration::from_secs(30)));
        let verdict = aggregator(oracle).analyze(&email()).await;

        assert_eq!(verdict.risk_score, 30);
        assert_eq!(verdict.risk_level, RiskLevel::Low);
        assert_ne!(verdict.risk_level, RiskLevel::Error);
    }

    #[tokio::test]
    async fn test_score_is_clamped() {
        let agg = RiskAggregator::with_detectors(RiskThresholds::default(), fixed(&[40, 40, 30, 20]));
        let verdict = agg.analyze(&email()).await;

        assert_eq!(verdict.risk_score, 100);
        assert_eq!(verdict.risk_level, RiskLevel::Critical);
        assert_eq!(verdict.findings.len(), 4);
    }

    #[tokio::test]
    async fn test_thresholds_can_be_overridden() {
        let strict = RiskThresholds {
            critical: 50,
            high: 30,
            medium: 10,
            low: 5,
        };
        let verdict = RiskAggregator::with_detectors(strict, fixed(&[20, 15]))
            .analyze(&email())
            .await;

        assert_eq!(verdict.risk_score, 35);
        assert_eq!(verdict.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn test_findings_keep_detector_order() {
        let detectors: Vec<Box<dyn Detector>> = vec![
            Box::new(Fixed(DetectorKind::Authentication, 20)),
            Box::new(Fixed(DetectorKind::Urls, 15)),
        ];
        let verdict = RiskAggregator::with_detectors(RiskThresholds::default(), detectors)
            .analyze(&email())
            .await;

        assert_eq!(verdict.findings[0].detector, DetectorKind::Authentication);
        assert_eq!(verdict.findings[1].detector, DetectorKind::Urls);
    }

    #[tokio::test]
    async fn test_detector_error_forces_error_verdict() {
        let detectors: Vec<Box<dyn Detector>> =
            vec![Box::new(Fixed(DetectorKind::Content, 10)), Box::new(Failing)];
        let verdict = RiskAggregator::with_detectors(RiskThresholds::default(), detectors)
            .analyze(&email())
            .await;

        assert_eq!(verdict.risk_score, 100);
        assert_eq!(verdict.risk_level, RiskLevel::Error);
        assert_eq!(verdict.findings.len(), 1);
        assert!(verdict.findings[0].message.contains("resolver state corrupted"));
    }

    #[tokio::test]
    async fn test_detector_panic_forces_error_verdict() {
        let detectors: Vec<Box<dyn Detector>> = vec![Box::new(Panicking)];
        let verdict = RiskAggregator::with_detectors(RiskThresholds::default(), detectors)
            .analyze(&email())
            .await;

        assert_eq!(verdict.risk_score, 100);
        assert_eq!(verdict.risk_level, RiskLevel::Error);
        assert!(verdict.findings[0].message.contains("index out of range"));
    }

    #[tokio::test]
    async fn test_analysis_is_repeatable() {
        let agg = aggregator(StaticOracle::replying("medium risk"));
        let mut suspicious = email();
        suspicious.body = "Claim at http://203.0.113.5/prize or https://bit.ly/x".to_string();

        let first = agg.analyze(&suspicious).await;
        let second = agg.analyze(&suspicious).await;

        assert_eq!(first, second);
        assert_eq!(first.risk_score, 20 + 20 + 10);
    }

    #[test]
    fn test_default_detector_order() {
        let agg = aggregator(StaticOracle::replying(""));
        assert_eq!(
            agg.detector_kinds(),
            vec![
                DetectorKind::Authentication,
                DetectorKind::Content,
                DetectorKind::Urls,
                DetectorKind::Sender
            ]
        );
    }
}
