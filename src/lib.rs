pub mod config;
pub mod dmarc;
pub mod dns;
pub mod domain_utils;
pub mod email;
pub mod engine;
pub mod features;
pub mod oracle;
pub mod spf;
pub mod store;

pub use config::EngineConfig;
pub use email::EmailRecord;
pub use engine::{RiskAggregator, RiskLevel, RiskVerdict};
pub use features::{DetectorResult, Finding};
