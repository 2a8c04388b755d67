//! Deferred job status
//!
//! Each `check_status` call performs at most one query against the
//! separation service. Terminal states settle the job and its owner's
//! quota; anything else, including a failed query, is reported as still
//! processing.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::jobs::{JobLookup, JobTable};
use crate::orchestrator::{classify, reconcile, SeparationResult};
use crate::quota::QuotaStore;
use crate::stem::Stem;
use crate::upstream::SeparationService;

/// Answer to a status query
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    Completed(SeparationResult),
    Processing { message: String },
}

/// Progress text shown while a job runs
pub fn processing_message(stem: Stem) -> String {
    format!("Processing - removing {}...", stem.label().to_lowercase())
}

/// Single non-blocking status query for deferred jobs
pub struct StatusEndpoint {
    quota: Arc<QuotaStore>,
    jobs: Arc<JobTable>,
    upstream: Arc<dyn SeparationService>,
}

impl StatusEndpoint {
    pub fn new(
        quota: Arc<QuotaStore>,
        jobs: Arc<JobTable>,
        upstream: Arc<dyn SeparationService>,
    ) -> Self {
        Self {
            quota,
            jobs,
            upstream,
        }
    }

    #[tracing::instrument(name = "status.check", skip(self), err(Display))]
    pub async fn check_status(&self, handle: &str) -> Result<StatusReport, ProxyError> {
        let handle = handle.trim();
        if handle.is_empty() {
            return Err(ProxyError::MissingField("uploadId"));
        }

        let job = match self.jobs.touch(handle) {
            JobLookup::Active(job) => job,
            JobLookup::Expired | JobLookup::Missing => return Err(ProxyError::NotFound),
        };

        let status = match self.upstream.check_task(&job.remote_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(upload_id = %job.remote_id, error = %e, "Status query failed");
                return Ok(StatusReport::Processing {
                    message: processing_message(job.stem),
                });
            }
        };

        debug!(upload_id = %job.remote_id, state = status.state.as_str(), "Task status");
        match classify(status) {
            None => Ok(StatusReport::Processing {
                message: processing_message(job.stem),
            }),
            Some(terminal) => {
                // A concurrent query may have settled the job already
                if self.jobs.remove(&job.remote_id).is_none() {
                    return Err(ProxyError::NotFound);
                }
                reconcile(&self.quota, &job.owner, job.stem, terminal).map(StatusReport::Completed)
            }
        }
    }
}
