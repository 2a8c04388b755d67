//! Deferred job table
//!
//! In deferred mode the proxy answers `process` right after the split was
//! accepted and the client polls `check_status` on its own. The table
//! remembers who owns each running job so the status query can reconcile
//! the owner's quota, and forgets jobs the client stopped asking about.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::metrics;
use crate::quota::QuotaStore;
use crate::stem::Stem;

/// One deferred separation job
#[derive(Debug, Clone)]
pub struct UploadJob {
    /// Remote asset id; also the handle given to the client
    pub remote_id: String,
    pub stem: Stem,
    /// Identity whose reservation the job holds
    pub owner: String,
    pub started_at: Instant,
    pub last_seen: Instant,
}

impl UploadJob {
    pub fn new(remote_id: &str, stem: Stem, owner: &str) -> Self {
        let now = Instant::now();
        Self {
            remote_id: remote_id.to_string(),
            stem,
            owner: owner.to_string(),
            started_at: now,
            last_seen: now,
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_seen.elapsed() > ttl
    }
}

/// Lookup outcome
#[derive(Debug, Clone)]
pub enum JobLookup {
    Active(UploadJob),
    /// The job went stale; it has been removed and its reservation released
    Expired,
    Missing,
}

/// Volatile table of deferred jobs
pub struct JobTable {
    jobs: DashMap<String, UploadJob>,
    quota: Arc<QuotaStore>,
    ttl: Duration,
}

impl JobTable {
    pub fn new(quota: Arc<QuotaStore>, ttl: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            quota,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, job: UploadJob) {
        self.jobs.insert(job.remote_id.clone(), job);
    }

    /// Fetch a job, refreshing its inactivity window
    ///
    /// A job past its window is expired on the spot.
    pub fn touch(&self, handle: &str) -> JobLookup {
        match self.jobs.get_mut(handle) {
            None => return JobLookup::Missing,
            Some(mut job) if !job.is_expired(self.ttl) => {
                job.last_seen = Instant::now();
                return JobLookup::Active(job.clone());
            }
            Some(_) => {}
        }

        if let Some((_, job)) = self
            .jobs
            .remove_if(handle, |_, job| job.is_expired(self.ttl))
        {
            self.expire(job);
        }
        JobLookup::Expired
    }

    /// Copy of a job without touching it
    pub fn get(&self, handle: &str) -> Option<UploadJob> {
        self.jobs.get(handle).map(|j| j.clone())
    }

    /// Remove a finished job
    pub fn remove(&self, handle: &str) -> Option<UploadJob> {
        self.jobs.remove(handle).map(|(_, job)| job)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn expire(&self, job: UploadJob) {
        let remaining = self.quota.debit(&job.owner);
        metrics::record_job_outcome("expired");
        info!(
            upload_id = %job.remote_id,
            owner = %job.owner,
            remaining,
            "Job expired"
        );
    }

    /// Expire every job inactive beyond the window; returns how many
    pub fn sweep(&self) -> usize {
        let mut stale = Vec::new();
        self.jobs.retain(|_, job| {
            if job.is_expired(self.ttl) {
                stale.push(job.clone());
                false
            } else {
                true
            }
        });

        let expired = stale.len();
        for job in stale {
            self.expire(job);
        }
        expired
    }

    /// Run [`sweep`](Self::sweep) on a fixed interval
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let expired = self.sweep();
                if expired > 0 {
                    info!(expired, active = self.len(), "Job sweep");
                }
            }
        })
    }
}
