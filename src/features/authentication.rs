use super::{Detector, DetectorKind, DetectorResult};
use crate::config::AuthenticationConfig;
use crate::dmarc::{DmarcStatus, DmarcVerifier};
use crate::dns::{DnsError, MailDns};
use crate::email::{sender_domain, EmailRecord, SenderError};
use crate::spf::SpfEvaluator;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
enum AuthCheckError {
    #[error(transparent)]
    Sender(#[from] SenderError),
    #[error(transparent)]
    Dns(#[from] DnsError),
    #[error("SPF/DMARC evaluation timed out after {0:?}")]
    Timeout(Duration),
}

/// SPF and DMARC posture of the From domain.
pub struct AuthenticationSignalChecker {
    dns: Arc<dyn MailDns>,
    config: AuthenticationConfig,
}

impl AuthenticationSignalChecker {
    pub fn new(dns: Arc<dyn MailDns>, config: &AuthenticationConfig) -> Self {
        Self {
            dns,
            config: config.clone(),
        }
    }

    async fn evaluate(
        &self,
        email: &EmailRecord,
        result: &mut DetectorResult,
    ) -> Result<(), AuthCheckError> {
        let domain = sender_domain(&email.sender)?;
        let client_ip = email.client_ip.unwrap_or(self.config.default_client_ip);

        let spf = SpfEvaluator::new(self.dns.as_ref(), client_ip)
            .check_host(&domain)
            .await?;
        if !spf.is_pass() {
            result.penalize(self.config.spf_penalty, format!("SPF check failed: {spf}"));
        }

        let dmarc = DmarcVerifier::verify(self.dns.as_ref(), &domain, spf).await?;
        if dmarc != DmarcStatus::Pass {
            result.penalize(
                self.config.dmarc_penalty,
                format!("DMARC check failed: {dmarc}"),
            );
        }

        log::debug!("Authentication for {domain}: spf={spf}, dmarc={dmarc}");
        Ok(())
    }
}

#[async_trait]
impl Detector for AuthenticationSignalChecker {
    async fn inspect(&self, email: &EmailRecord) -> anyhow::Result<DetectorResult> {
        let mut result = DetectorResult::new(DetectorKind::Authentication);

        let timeout = self.config.timeout();
        let outcome = match tokio::time::timeout(timeout, self.evaluate(email, &mut result)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AuthCheckError::Timeout(timeout)),
        };

        if let Err(e) = outcome {
            log::warn!("Authentication check for email {} failed: {e}", email.id);
            result.penalize(
                self.config.error_penalty,
                format!("Error checking email authentication: {e}"),
            );
        }

        Ok(result)
    }

    fn kind(&self) -> DetectorKind {
        DetectorKind::Authentication
    }
}
