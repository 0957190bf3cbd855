pub mod authentication;
pub mod content_analyzer;
pub mod link_analyzer;
pub mod sender_identity;

use crate::email::EmailRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use authentication::AuthenticationSignalChecker;
pub use content_analyzer::ContentRiskAnalyzer;
pub use link_analyzer::UrlRiskScanner;
pub use sender_identity::SenderIdentityAnalyzer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Authentication,
    Content,
    Urls,
    Sender,
    /// Produced by the aggregator itself
    Engine,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorKind::Authentication => "authentication",
            DetectorKind::Content => "content",
            DetectorKind::Urls => "urls",
            DetectorKind::Sender => "sender",
            DetectorKind::Engine => "engine",
        })
    }
}

/// One observation, tagged with the detector that made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub detector: DetectorKind,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.detector, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorResult {
    pub detector: DetectorKind,
    pub risk_contribution: u32,
    pub findings: Vec<Finding>,
}

impl DetectorResult {
    pub fn new(detector: DetectorKind) -> Self {
        Self {
            detector,
            risk_contribution: 0,
            findings: Vec::new(),
        }
    }

    /// Add `points` together with the finding that explains them.
    pub fn penalize(&mut self, points: u32, message: impl Into<String>) {
        self.risk_contribution = self.risk_contribution.saturating_add(points);
        self.note(message);
    }

    /// Record a finding without changing the contribution.
    pub fn note(&mut self, message: impl Into<String>) {
        self.findings.push(Finding {
            detector: self.detector,
            message: message.into(),
        });
    }
}

/// A read-only inspection of one facet of an email.
///
/// Implementations absorb their own lookup and parsing failures into a
/// penalty plus finding; an `Err` is reserved for conditions the aggregator
/// must treat as a failed analysis.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn inspect(&self, email: &EmailRecord) -> anyhow::Result<DetectorResult>;
    fn kind(&self) -> DetectorKind;
}
