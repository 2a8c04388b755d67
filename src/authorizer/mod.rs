//! Upload authorization
//!
//! Decides whether a client may upload a file and, if so, reserves one unit
//! of its daily quota and hands out a presigned upload ticket. Checks run in
//! a fixed order and the first failure wins:
//!
//! 1. quota (in flight or daily limit reached)
//! 2. declared size
//! 3. declared duration
//! 4. file extension
//!
//! Only when all of them pass is the reservation placed.

pub mod credential;

pub use credential::{CredentialClaims, CredentialError, CredentialSigner, UploadCredential};

use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{LimitsConfig, UpstreamConfig};
use crate::error::ProxyError;
use crate::metrics;
use crate::quota::{QuotaCheck, QuotaDenial, QuotaStore};
use crate::upstream::SeparationService;

/// Successful authorization
#[derive(Debug, Clone)]
pub struct Authorization {
    pub credential: UploadCredential,
    /// Remaining quota, already excluding the reserved unit
    pub remaining: u32,
}

/// Result of the legacy proxied upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReceipt {
    pub upload_id: String,
    pub remaining: u32,
}

/// Validates uploads against limits and the quota store
pub struct UploadAuthorizer {
    quota: Arc<QuotaStore>,
    limits: LimitsConfig,
    signer: CredentialSigner,
    upstream: Arc<dyn SeparationService>,
}

impl UploadAuthorizer {
    pub fn new(
        quota: Arc<QuotaStore>,
        limits: LimitsConfig,
        signer: CredentialSigner,
        upstream: Arc<dyn SeparationService>,
    ) -> Self {
        Self {
            quota,
            limits,
            signer,
            upstream,
        }
    }

    /// Build the signer from the upstream section
    pub fn signer_for(upstream: &UpstreamConfig) -> CredentialSigner {
        CredentialSigner::new(
            &upstream.upload_signing_secret,
            &format!("{}/api/upload/", upstream.base_url.trim_end_matches('/')),
            upstream.credential_ttl(),
        )
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    fn denial(check: &QuotaCheck) -> Option<ProxyError> {
        let reason = check.reason?;
        metrics::record_quota_rejection(reason.as_str());
        Some(match reason {
            QuotaDenial::InFlight => ProxyError::AlreadyProcessing {
                remaining: check.remaining,
            },
            QuotaDenial::LimitReached => ProxyError::QuotaExceeded {
                remaining: check.remaining,
            },
        })
    }

    fn check_extension(&self, filename: &str) -> Result<(), ProxyError> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let allowed = self
            .limits
            .allowed_extensions
            .iter()
            .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(&extension));
        if extension.is_empty() || !allowed {
            return Err(ProxyError::UnsupportedFormat(format!(
                "'{}' (accepted: {})",
                filename,
                self.limits.allowed_extensions.join(", ")
            )));
        }
        Ok(())
    }

    /// Run every check, then reserve; returns the post-reservation quota
    fn validate_and_reserve(
        &self,
        identity: &str,
        filename: &str,
        size: u64,
        duration: Option<f64>,
    ) -> Result<QuotaCheck, ProxyError> {
        if filename.trim().is_empty() {
            return Err(ProxyError::MissingField("filename"));
        }

        let check = self.quota.check(identity);
        if let Some(err) = Self::denial(&check) {
            return Err(err);
        }

        if size > self.limits.max_file_size {
            return Err(ProxyError::FileTooLarge {
                size,
                max: self.limits.max_file_size,
            });
        }

        if let Some(duration) = duration {
            if !duration.is_finite() || duration < 0.0 {
                return Err(ProxyError::InvalidBody(format!(
                    "duration '{}' is not a length in seconds",
                    duration
                )));
            }
            if duration > self.limits.max_duration_seconds {
                return Err(ProxyError::DurationExceeded {
                    duration,
                    max: self.limits.max_duration_seconds,
                });
            }
        }

        self.check_extension(filename)?;

        // Another request of the same identity may have won the race since check()
        self.quota.reserve(identity)
    }

    /// Authorize a direct-to-service upload
    #[tracing::instrument(name = "authorizer.authorize", skip(self), err(Display))]
    pub fn authorize(
        &self,
        identity: &str,
        filename: &str,
        size: u64,
        duration: Option<f64>,
    ) -> Result<Authorization, ProxyError> {
        let check = self.validate_and_reserve(identity, filename, size, duration)?;

        let credential = match self.signer.issue(identity, filename, size) {
            Ok(credential) => credential,
            Err(e) => {
                self.quota.debit(identity);
                return Err(ProxyError::Misconfiguration(e.to_string()));
            }
        };

        info!(
            identity = %identity,
            size,
            remaining = check.remaining,
            "Upload authorized"
        );
        Ok(Authorization {
            credential,
            remaining: check.remaining,
        })
    }

    /// Authorize and forward file bytes through the proxy
    #[tracing::instrument(
        name = "authorizer.upload",
        skip(self, body),
        fields(upload.bytes = body.len()),
        err(Display)
    )]
    pub async fn authorize_and_upload(
        &self,
        identity: &str,
        filename: &str,
        duration: Option<f64>,
        body: Bytes,
    ) -> Result<UploadReceipt, ProxyError> {
        let check = self.validate_and_reserve(identity, filename, body.len() as u64, duration)?;

        match self.upstream.upload(body, filename).await {
            Ok(upload_id) => {
                info!(identity = %identity, upload_id = %upload_id, "Upload forwarded");
                Ok(UploadReceipt {
                    upload_id,
                    remaining: check.remaining,
                })
            }
            Err(e) => {
                let remaining = self.quota.debit(identity);
                warn!(identity = %identity, error = %e, "Upload to separation service failed");
                metrics::record_job_outcome("upload_failed");
                Err(ProxyError::InitializationFailed {
                    message: e.to_string(),
                    remaining,
                })
            }
        }
    }
}
