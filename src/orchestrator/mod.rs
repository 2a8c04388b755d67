//! Separation orchestration
//!
//! Starts the remote split for an uploaded asset and follows it to a
//! terminal state. Every path out of here reconciles the caller's
//! reservation exactly once:
//!
//! | Remote outcome | Quota | Result |
//! |----------------|-------|--------|
//! | success with both links | credit | [`SplitOutcome::Completed`] |
//! | success without links, error, cancelled | debit | `upstream_task_failed` |
//! | split refused or unreachable | debit | `upstream_initialization_failed` |
//! | too many consecutive query failures | debit | `upstream_task_failed` |
//! | status query refused (4xx, rejected, malformed) | debit | `upstream_task_failed` |
//! | attempts exhausted | debit | `upstream_timeout` |
//!
//! In deferred mode the job is parked in the [`JobTable`] instead and the
//! status endpoint does the reconciliation.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{PollConfig, ProcessingMode};
use crate::error::ProxyError;
use crate::jobs::{JobTable, UploadJob};
use crate::metrics;
use crate::quota::QuotaStore;
use crate::stem::Stem;
use crate::upstream::{SeparationService, TaskState, TaskStatus};

/// Links to a finished separation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeparationResult {
    pub back_track_url: String,
    pub stem_track_url: String,
    pub stem: Stem,
    pub remaining: u32,
}

/// Outcome of a `process` request
#[derive(Debug, Clone, PartialEq)]
pub enum SplitOutcome {
    Completed(SeparationResult),
    Pending {
        upload_id: String,
        stem: Stem,
        remaining: u32,
    },
}

/// Terminal classification of one task status
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Terminal {
    Succeeded {
        back_track_url: String,
        stem_track_url: String,
    },
    Failed(String),
}

/// `None` while the task is still running
pub(crate) fn classify(status: TaskStatus) -> Option<Terminal> {
    match status.state {
        TaskState::Queued | TaskState::Processing => None,
        TaskState::Success => match (status.back_track_url, status.stem_track_url) {
            (Some(back_track_url), Some(stem_track_url)) => Some(Terminal::Succeeded {
                back_track_url,
                stem_track_url,
            }),
            _ => Some(Terminal::Failed(
                "task finished without result links".to_string(),
            )),
        },
        state @ (TaskState::Error | TaskState::Cancelled) => Some(Terminal::Failed(
            status
                .error
                .unwrap_or_else(|| format!("task {}", state.as_str())),
        )),
    }
}

/// How the poll loop ended
#[derive(Debug, Clone, PartialEq)]
enum PollOutcome {
    Finished(Terminal),
    TimedOut { attempts: u32 },
}

/// Delay before the next query after `failures` consecutive errors
fn next_delay(poll: &PollConfig, failures: u32) -> Duration {
    if failures == 0 {
        return poll.interval();
    }
    let factor = 2u32.saturating_pow(failures - 1);
    poll.interval()
        .checked_mul(factor)
        .unwrap_or(poll.max_backoff())
        .min(poll.max_backoff())
}

/// Query the task until it is terminal or the attempt budget is spent
async fn poll_until_terminal(
    upstream: &dyn SeparationService,
    poll: &PollConfig,
    asset_id: &str,
) -> PollOutcome {
    let mut failures = 0u32;

    for attempt in 1..=poll.max_attempts {
        match upstream.check_task(asset_id).await {
            Ok(status) => {
                failures = 0;
                metrics::record_poll_attempt(status.state.as_str());
                debug!(attempt, state = status.state.as_str(), "Task status");
                if let Some(terminal) = classify(status) {
                    return PollOutcome::Finished(terminal);
                }
            }
            Err(e) if !e.is_transient() => {
                metrics::record_poll_attempt("failed");
                warn!(attempt, error = %e, "Task status query refused");
                return PollOutcome::Finished(Terminal::Failed(format!(
                    "task status query refused: {}",
                    e
                )));
            }
            Err(e) => {
                failures += 1;
                metrics::record_poll_attempt("failed");
                warn!(attempt, failures, error = %e, "Task status query failed");
                if failures >= poll.max_transport_failures {
                    return PollOutcome::Finished(Terminal::Failed(format!(
                        "separation service unreachable after {} attempts: {}",
                        failures, e
                    )));
                }
            }
        }

        if attempt < poll.max_attempts {
            tokio::time::sleep(next_delay(poll, failures)).await;
        }
    }

    PollOutcome::TimedOut {
        attempts: poll.max_attempts,
    }
}

/// Apply a terminal outcome to the owner's quota
pub(crate) fn reconcile(
    quota: &QuotaStore,
    identity: &str,
    stem: Stem,
    terminal: Terminal,
) -> Result<SeparationResult, ProxyError> {
    match terminal {
        Terminal::Succeeded {
            back_track_url,
            stem_track_url,
        } => {
            let remaining = quota.credit(identity);
            metrics::record_job_outcome("success");
            info!(identity = %identity, stem = %stem, remaining, "Separation completed");
            Ok(SeparationResult {
                back_track_url,
                stem_track_url,
                stem,
                remaining,
            })
        }
        Terminal::Failed(message) => {
            let remaining = quota.debit(identity);
            metrics::record_job_outcome("failed");
            warn!(identity = %identity, stem = %stem, error = %message, "Separation failed");
            Err(ProxyError::ProcessingFailed { message, remaining })
        }
    }
}

/// Drives remote split tasks
pub struct SeparationOrchestrator {
    quota: Arc<QuotaStore>,
    jobs: Arc<JobTable>,
    upstream: Arc<dyn SeparationService>,
    poll: PollConfig,
}

impl SeparationOrchestrator {
    pub fn new(
        quota: Arc<QuotaStore>,
        jobs: Arc<JobTable>,
        upstream: Arc<dyn SeparationService>,
        poll: PollConfig,
    ) -> Self {
        Self {
            quota,
            jobs,
            upstream,
            poll,
        }
    }

    /// Start separating `stem` out of an uploaded asset
    #[tracing::instrument(name = "orchestrator.start_split", skip(self), err(Display))]
    pub async fn start_split(
        &self,
        identity: &str,
        asset_id: &str,
        stem: &str,
        mode: ProcessingMode,
    ) -> Result<SplitOutcome, ProxyError> {
        let stem: Stem = stem.parse()?;
        let asset_id = asset_id.trim();
        if asset_id.is_empty() {
            return Err(ProxyError::MissingField("uploadId"));
        }
        self.quota.claim(identity)?;

        let refusal = match self.upstream.start_split(asset_id, stem).await {
            Ok(ack) if ack.accepted => None,
            Ok(ack) => Some(
                ack.message
                    .unwrap_or_else(|| "split request was not accepted".to_string()),
            ),
            Err(e) => Some(e.to_string()),
        };
        if let Some(message) = refusal {
            let remaining = self.quota.debit(identity);
            metrics::record_job_outcome("init_failed");
            warn!(identity = %identity, error = %message, "Split could not be started");
            return Err(ProxyError::InitializationFailed { message, remaining });
        }

        match mode {
            ProcessingMode::Deferred => {
                self.jobs.insert(UploadJob::new(asset_id, stem, identity));
                let remaining = self.quota.check(identity).remaining;
                info!(identity = %identity, upload_id = %asset_id, "Split started, deferred");
                Ok(SplitOutcome::Pending {
                    upload_id: asset_id.to_string(),
                    stem,
                    remaining,
                })
            }
            ProcessingMode::Sync => self
                .run_to_completion(identity, asset_id, stem)
                .await
                .map(SplitOutcome::Completed),
        }
    }

    /// Poll in a detached task so reconciliation survives a dropped request
    async fn run_to_completion(
        &self,
        identity: &str,
        asset_id: &str,
        stem: Stem,
    ) -> Result<SeparationResult, ProxyError> {
        let quota = self.quota.clone();
        let upstream = self.upstream.clone();
        let poll = self.poll.clone();
        let identity = identity.to_string();
        let asset_id = asset_id.to_string();

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = poll_until_terminal(upstream.as_ref(), &poll, &asset_id).await;
            metrics::observe_job_duration(started.elapsed().as_secs_f64());

            match outcome {
                PollOutcome::Finished(terminal) => reconcile(&quota, &identity, stem, terminal),
                PollOutcome::TimedOut { attempts } => {
                    let remaining = quota.debit(&identity);
                    metrics::record_job_outcome("timeout");
                    warn!(identity = %identity, attempts, "Separation timed out");
                    Err(ProxyError::ProcessingTimeout {
                        attempts,
                        remaining,
                    })
                }
            }
        });

        task.await
            .map_err(|e| ProxyError::Unexpected(format!("poll task aborted: {}", e)))?
    }

    /// Download a finished track for attachment delivery
    #[tracing::instrument(name = "orchestrator.fetch_track", skip(self), err(Display))]
    pub async fn fetch_track(&self, identity: &str, url: &str) -> Result<Bytes, ProxyError> {
        self.upstream.fetch_track(url).await.map_err(|e| {
            ProxyError::ProcessingFailed {
                message: format!("could not download result: {}", e),
                remaining: self.quota.check(identity).remaining,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::ManualClock;
    use crate::upstream::{MockSeparationService, SplitAck, UpstreamError};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicU32, Ordering};

    const CLIENT: &str = "10.0.0.1";

    fn quota(limit: u32) -> Arc<QuotaStore> {
        let clock = Arc::new(ManualClock::new(
            NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
        ));
        Arc::new(QuotaStore::with_clock(
            limit,
            Vec::new(),
            Duration::from_secs(900),
            clock,
        ))
    }

    fn poll_config() -> PollConfig {
        PollConfig {
            interval_ms: 2000,
            max_attempts: 150,
            max_transport_failures: 5,
            max_backoff_ms: 30_000,
        }
    }

    fn orchestrator(
        quota: Arc<QuotaStore>,
        upstream: MockSeparationService,
    ) -> (SeparationOrchestrator, Arc<JobTable>) {
        let jobs = Arc::new(JobTable::new(quota.clone(), Duration::from_secs(600)));
        let orch =
            SeparationOrchestrator::new(quota, jobs.clone(), Arc::new(upstream), poll_config());
        (orch, jobs)
    }

    fn accepting(upstream: &mut MockSeparationService) {
        upstream.expect_start_split().returning(|_, _| {
            Ok(SplitAck {
                accepted: true,
                message: None,
            })
        });
    }

    /// Serve `pending` statuses, then `last`
    fn statuses(
        upstream: &mut MockSeparationService,
        pending: u32,
        last: Result<TaskStatus, UpstreamError>,
    ) -> Arc<AtomicU32> {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        upstream.expect_check_task().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < pending {
                Ok(TaskStatus::pending(TaskState::Processing))
            } else {
                last.clone()
            }
        });
        calls
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_three_polls_credits_once() {
        let quota = quota(3);
        quota.reserve(CLIENT).unwrap();
        let mut upstream = MockSeparationService::new();
        accepting(&mut upstream);
        let calls = statuses(
            &mut upstream,
            2,
            Ok(TaskStatus::succeeded("https://cdn/back.mp3", "https://cdn/stem.mp3")),
        );
        let (orch, _) = orchestrator(quota.clone(), upstream);

        let outcome = orch
            .start_split(CLIENT, "asset-1", "vocals", ProcessingMode::Sync)
            .await
            .unwrap();

        let SplitOutcome::Completed(result) = outcome else {
            panic!("expected completed outcome");
        };
        assert_eq!(result.back_track_url, "https://cdn/back.mp3");
        assert_eq!(result.stem_track_url, "https://cdn/stem.mp3");
        assert_eq!(result.stem, Stem::Vocals);
        assert_eq!(result.remaining, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let check = quota.check(CLIENT);
        assert_eq!(check.count, 1);
        assert!(!check.in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_error_on_first_poll_is_net_zero() {
        let quota = quota(3);
        quota.reserve(CLIENT).unwrap();
        let mut upstream = MockSeparationService::new();
        accepting(&mut upstream);
        statuses(
            &mut upstream,
            0,
            Ok(TaskStatus::failed(TaskState::Error, "corrupt input")),
        );
        let (orch, _) = orchestrator(quota.clone(), upstream);

        let err = orch
            .start_split(CLIENT, "asset-1", "drums", ProcessingMode::Sync)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::ProcessingFailed { remaining: 3, ref message } if message == "corrupt input"
        ));
        assert_eq!(err.status_code(), hyper::StatusCode::BAD_GATEWAY);

        let check = quota.check(CLIENT);
        assert_eq!(check.count, 0);
        assert!(!check.in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_without_links_is_failure() {
        let quota = quota(3);
        quota.reserve(CLIENT).unwrap();
        let mut upstream = MockSeparationService::new();
        accepting(&mut upstream);
        statuses(&mut upstream, 0, Ok(TaskStatus::pending(TaskState::Success)));
        let (orch, _) = orchestrator(quota.clone(), upstream);

        let err = orch
            .start_split(CLIENT, "asset-1", "bass", ProcessingMode::Sync)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "processing_failed");
        assert_eq!(quota.check(CLIENT).count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted_times_out() {
        let quota = quota(3);
        quota.reserve(CLIENT).unwrap();
        let mut upstream = MockSeparationService::new();
        accepting(&mut upstream);
        let calls = statuses(&mut upstream, u32::MAX, Ok(TaskStatus::pending(TaskState::Queued)));
        let (orch, _) = orchestrator(quota.clone(), upstream);

        let started = tokio::time::Instant::now();
        let err = orch
            .start_split(CLIENT, "asset-1", "piano", ProcessingMode::Sync)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProxyError::ProcessingTimeout {
                attempts: 150,
                remaining: 3
            }
        ));
        assert_eq!(err.status_code(), hyper::StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(calls.load(Ordering::SeqCst), 150);
        // 149 sleeps of two seconds between 150 queries
        assert_eq!(started.elapsed(), Duration::from_secs(298));
        assert!(!quota.check(CLIENT).in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_are_retried() {
        let quota = quota(3);
        quota.reserve(CLIENT).unwrap();
        let mut upstream = MockSeparationService::new();
        accepting(&mut upstream);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        upstream.expect_check_task().returning(move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(UpstreamError::Transport("connection reset".into())),
                _ => Ok(TaskStatus::succeeded("https://cdn/b.mp3", "https://cdn/s.mp3")),
            }
        });
        let (orch, _) = orchestrator(quota.clone(), upstream);

        let started = tokio::time::Instant::now();
        let outcome = orch
            .start_split(CLIENT, "asset-1", "strings", ProcessingMode::Sync)
            .await
            .unwrap();
        assert!(matches!(outcome, SplitOutcome::Completed(_)));
        // Backoff of 2s then 4s
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert_eq!(quota.check(CLIENT).count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_transport_failure_aborts() {
        let quota = quota(3);
        quota.reserve(CLIENT).unwrap();
        let mut upstream = MockSeparationService::new();
        accepting(&mut upstream);
        let calls = statuses(
            &mut upstream,
            0,
            Err(UpstreamError::Transport("connection refused".into())),
        );
        let (orch, _) = orchestrator(quota.clone(), upstream);

        let err = orch
            .start_split(CLIENT, "asset-1", "wind", ProcessingMode::Sync)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "processing_failed");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(quota.check(CLIENT).count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_status_query_fails_without_retry() {
        let quota = quota(3);
        quota.reserve(CLIENT).unwrap();
        let mut upstream = MockSeparationService::new();
        accepting(&mut upstream);
        let calls = statuses(
            &mut upstream,
            0,
            Err(UpstreamError::Status {
                status: 401,
                body: "invalid license".into(),
            }),
        );
        let (orch, _) = orchestrator(quota.clone(), upstream);

        let started = tokio::time::Instant::now();
        let err = orch
            .start_split(CLIENT, "asset-1", "vocals", ProcessingMode::Sync)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ProcessingFailed { remaining: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(!quota.check(CLIENT).in_flight);
    }

    #[tokio::test]
    async fn test_second_split_on_one_reservation_rejected() {
        let quota = quota(3);
        quota.reserve(CLIENT).unwrap();
        let mut upstream = MockSeparationService::new();
        upstream.expect_start_split().times(1).returning(|_, _| {
            Ok(SplitAck {
                accepted: true,
                message: None,
            })
        });
        let (orch, jobs) = orchestrator(quota.clone(), upstream);

        orch.start_split(CLIENT, "asset-1", "vocals", ProcessingMode::Deferred)
            .await
            .unwrap();
        let err = orch
            .start_split(CLIENT, "asset-2", "drums", ProcessingMode::Deferred)
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::AlreadyProcessing { remaining: 2 }));
        assert_eq!(err.status_code(), hyper::StatusCode::TOO_MANY_REQUESTS);
        assert!(jobs.get("asset-2").is_none());
        assert_eq!(quota.check(CLIENT).count, 1);
    }

    #[tokio::test]
    async fn test_invalid_stem_rejected_before_anything_else() {
        let quota = quota(3);
        // No expectations: any upstream call would panic
        let (orch, _) = orchestrator(quota.clone(), MockSeparationService::new());

        let err = orch
            .start_split(CLIENT, "asset-1", "saxophone", ProcessingMode::Sync)
            .await
            .unwrap_err();
        assert_eq!(err.kind().as_str(), "validation");
        assert_eq!(err.reason(), "invalid_stem");
        assert!(quota.snapshot(CLIENT).is_none());
    }

    #[tokio::test]
    async fn test_process_without_reservation_rejected() {
        let (orch, _) = orchestrator(quota(3), MockSeparationService::new());
        let err = orch
            .start_split(CLIENT, "asset-1", "vocals", ProcessingMode::Sync)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoReservation));
    }

    #[tokio::test]
    async fn test_refused_split_releases_reservation() {
        let quota = quota(3);
        quota.reserve(CLIENT).unwrap();
        let mut upstream = MockSeparationService::new();
        upstream.expect_start_split().returning(|_, _| {
            Ok(SplitAck {
                accepted: false,
                message: Some("asset not found".into()),
            })
        });
        let (orch, _) = orchestrator(quota.clone(), upstream);

        let err = orch
            .start_split(CLIENT, "asset-1", "vocals", ProcessingMode::Sync)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::InitializationFailed { remaining: 3, .. }
        ));
        assert!(!quota.has_reservation(CLIENT));
    }

    #[tokio::test]
    async fn test_deferred_mode_parks_job() {
        let quota = quota(3);
        quota.reserve(CLIENT).unwrap();
        let mut upstream = MockSeparationService::new();
        accepting(&mut upstream);
        let (orch, jobs) = orchestrator(quota.clone(), upstream);

        let outcome = orch
            .start_split(CLIENT, "asset-9", "electric-guitar", ProcessingMode::Deferred)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SplitOutcome::Pending {
                upload_id: "asset-9".into(),
                stem: Stem::ElectricGuitar,
                remaining: 2
            }
        );
        let job = jobs.get("asset-9").unwrap();
        assert_eq!(job.owner, CLIENT);
        assert_eq!(job.stem, Stem::ElectricGuitar);
        assert!(quota.has_reservation(CLIENT));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let poll = poll_config();
        assert_eq!(next_delay(&poll, 0), Duration::from_secs(2));
        assert_eq!(next_delay(&poll, 1), Duration::from_secs(2));
        assert_eq!(next_delay(&poll, 2), Duration::from_secs(4));
        assert_eq!(next_delay(&poll, 3), Duration::from_secs(8));
        assert_eq!(next_delay(&poll, 10), Duration::from_secs(30));
        assert_eq!(next_delay(&poll, 64), Duration::from_secs(30));
    }
}
