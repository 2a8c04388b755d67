//! Per-client daily quota store
//!
//! Tracks how many separations each client identity (its network address)
//! has used today, plus an in-flight flag allowing at most one running job per
//! identity.
//!
//! # Reservation model
//!
//! Quota is reserved optimistically when an upload is authorized: the
//! identity is marked in flight and one unit is consumed provisionally. When
//! the job finishes the reservation is reconciled:
//!
//! - [`QuotaStore::credit`] commits the unit (success)
//! - [`QuotaStore::debit`] gives it back (any failure after the reservation)
//!
//! A successful job therefore costs exactly one unit and a failed one costs
//! nothing. Entries are keyed per identity in a [`DashMap`], so every
//! operation is a single entry-scoped read-modify-write and identities never
//! contend on a shared lock.
//!
//! The store is volatile and process-local. Running several proxy instances
//! behind a load balancer gives each instance its own counters.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use chrono::NaiveDate;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::metrics;

/// Why a quota check refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDenial {
    InFlight,
    LimitReached,
}

impl QuotaDenial {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaDenial::InFlight => "in_flight",
            QuotaDenial::LimitReached => "limit_reached",
        }
    }
}

/// Result of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCheck {
    pub allowed: bool,
    pub remaining: u32,
    pub count: u32,
    pub in_flight: bool,
    pub reason: Option<QuotaDenial>,
}

/// Quota state of one client identity
#[derive(Debug, Clone)]
pub struct ClientQuota {
    pub count: u32,
    pub date: NaiveDate,
    pub in_flight: bool,
    pub in_flight_since: Option<Instant>,
    /// A split job already runs on the current reservation
    pub job_started: bool,
}

impl ClientQuota {
    fn new(today: NaiveDate) -> Self {
        Self {
            count: 0,
            date: today,
            in_flight: false,
            in_flight_since: None,
            job_started: false,
        }
    }

    /// Reset the entry when it belongs to an earlier day
    fn roll_over(&mut self, today: NaiveDate) {
        if self.date != today {
            *self = Self::new(today);
        }
    }

    fn reserve(&mut self, daily_limit: u32) {
        self.count = (self.count + 1).min(daily_limit);
        self.in_flight = true;
        self.in_flight_since = Some(Instant::now());
        self.job_started = false;
    }

    fn clear_in_flight(&mut self) {
        self.in_flight = false;
        self.in_flight_since = None;
        self.job_started = false;
    }
}

/// Outcome of one sweep pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries dropped because their day is over
    pub removed: usize,
    /// Abandoned reservations given back
    pub released: usize,
}

/// In-memory quota store
pub struct QuotaStore {
    entries: DashMap<String, ClientQuota>,
    daily_limit: u32,
    exempt: HashSet<String>,
    max_in_flight: Duration,
    clock: Arc<dyn Clock>,
}

impl QuotaStore {
    /// Create a store using the system's local calendar day
    pub fn new(
        daily_limit: u32,
        exempt: impl IntoIterator<Item = String>,
        max_in_flight: Duration,
    ) -> Self {
        Self::with_clock(daily_limit, exempt, max_in_flight, Arc::new(SystemClock))
    }

    /// Create a store with an explicit clock
    pub fn with_clock(
        daily_limit: u32,
        exempt: impl IntoIterator<Item = String>,
        max_in_flight: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            daily_limit,
            exempt: exempt.into_iter().collect(),
            max_in_flight,
            clock,
        }
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Whether the identity bypasses every limit
    pub fn is_exempt(&self, identity: &str) -> bool {
        self.exempt.contains(identity)
    }

    fn evaluate(&self, quota: &ClientQuota) -> QuotaCheck {
        let remaining = self.daily_limit.saturating_sub(quota.count);
        let reason = if quota.in_flight {
            Some(QuotaDenial::InFlight)
        } else if quota.count >= self.daily_limit {
            Some(QuotaDenial::LimitReached)
        } else {
            None
        };

        QuotaCheck {
            allowed: reason.is_none(),
            remaining,
            count: quota.count,
            in_flight: quota.in_flight,
            reason,
        }
    }

    fn exempt_check(&self) -> QuotaCheck {
        QuotaCheck {
            allowed: true,
            remaining: self.daily_limit,
            count: 0,
            in_flight: false,
            reason: None,
        }
    }

    /// Check whether the identity may start a new upload
    pub fn check(&self, identity: &str) -> QuotaCheck {
        if self.is_exempt(identity) {
            return self.exempt_check();
        }

        let today = self.clock.today();
        let mut entry = self
            .entries
            .entry(identity.to_string())
            .or_insert_with(|| ClientQuota::new(today));
        entry.roll_over(today);
        self.evaluate(&entry)
    }

    /// Check and reserve in one step
    ///
    /// On success the identity is in flight and one unit is provisionally
    /// consumed; the returned check reflects the state after the reservation.
    pub fn reserve(&self, identity: &str) -> Result<QuotaCheck, ProxyError> {
        if self.is_exempt(identity) {
            return Ok(self.exempt_check());
        }

        let today = self.clock.today();
        let mut entry = self
            .entries
            .entry(identity.to_string())
            .or_insert_with(|| ClientQuota::new(today));
        entry.roll_over(today);

        let check = self.evaluate(&entry);
        match check.reason {
            Some(QuotaDenial::InFlight) => {
                metrics::record_quota_rejection(QuotaDenial::InFlight.as_str());
                Err(ProxyError::AlreadyProcessing {
                    remaining: check.remaining,
                })
            }
            Some(QuotaDenial::LimitReached) => {
                metrics::record_quota_rejection(QuotaDenial::LimitReached.as_str());
                Err(ProxyError::QuotaExceeded {
                    remaining: check.remaining,
                })
            }
            None => {
                entry.reserve(self.daily_limit);
                debug!(identity = %identity, count = entry.count, "Quota reserved");
                Ok(self.evaluate(&entry))
            }
        }
    }

    /// Set or clear the in-flight flag
    ///
    /// Setting places a provisional reservation if none is held. Clearing
    /// only drops the flag and leaves the count alone.
    pub fn mark_in_flight(&self, identity: &str, in_flight: bool) {
        if self.is_exempt(identity) {
            return;
        }

        let today = self.clock.today();
        let mut entry = self
            .entries
            .entry(identity.to_string())
            .or_insert_with(|| ClientQuota::new(today));
        entry.roll_over(today);

        if in_flight {
            if !entry.in_flight {
                entry.reserve(self.daily_limit);
            }
        } else {
            entry.clear_in_flight();
        }
    }

    /// Reconcile a successful job; returns the remaining quota
    pub fn credit(&self, identity: &str) -> u32 {
        if self.is_exempt(identity) {
            return self.daily_limit;
        }

        let today = self.clock.today();
        let mut entry = self
            .entries
            .entry(identity.to_string())
            .or_insert_with(|| ClientQuota::new(today));
        entry.roll_over(today);

        if entry.in_flight {
            entry.clear_in_flight();
        } else {
            // Reservation already released by the sweep; count the success now
            entry.count = (entry.count + 1).min(self.daily_limit);
        }

        debug!(identity = %identity, count = entry.count, "Quota credited");
        self.daily_limit.saturating_sub(entry.count)
    }

    /// Reconcile a failed job; returns the remaining quota
    pub fn debit(&self, identity: &str) -> u32 {
        if self.is_exempt(identity) {
            return self.daily_limit;
        }

        let today = self.clock.today();
        let mut entry = self
            .entries
            .entry(identity.to_string())
            .or_insert_with(|| ClientQuota::new(today));
        entry.roll_over(today);

        if entry.in_flight {
            entry.count = entry.count.saturating_sub(1);
            entry.clear_in_flight();
        }

        debug!(identity = %identity, count = entry.count, "Quota debited");
        self.daily_limit.saturating_sub(entry.count)
    }

    /// Bind the current reservation to a split job
    ///
    /// Succeeds once per reservation. A second claim while the first job is
    /// still running fails with `already_processing`.
    pub fn claim(&self, identity: &str) -> Result<(), ProxyError> {
        if self.is_exempt(identity) {
            return Ok(());
        }

        let today = self.clock.today();
        let mut entry = match self.entries.get_mut(identity) {
            Some(entry) if entry.date == today && entry.in_flight => entry,
            _ => return Err(ProxyError::NoReservation),
        };

        if entry.job_started {
            let remaining = self.daily_limit.saturating_sub(entry.count);
            metrics::record_quota_rejection(QuotaDenial::InFlight.as_str());
            return Err(ProxyError::AlreadyProcessing { remaining });
        }

        entry.job_started = true;
        debug!(identity = %identity, "Reservation claimed");
        Ok(())
    }

    /// Whether the identity currently holds a reservation
    pub fn has_reservation(&self, identity: &str) -> bool {
        if self.is_exempt(identity) {
            return true;
        }
        let today = self.clock.today();
        self.entries
            .get(identity)
            .map(|q| q.date == today && q.in_flight)
            .unwrap_or(false)
    }

    /// Copy of the stored entry, if any
    pub fn snapshot(&self, identity: &str) -> Option<ClientQuota> {
        self.entries.get(identity).map(|q| q.clone())
    }

    /// Number of tracked identities
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop stale days and release abandoned reservations
    pub fn sweep(&self) -> SweepStats {
        let today = self.clock.today();
        let mut stats = SweepStats::default();

        self.entries.retain(|_, quota| {
            if quota.date != today {
                stats.removed += 1;
                return false;
            }

            let abandoned = quota
                .in_flight_since
                .map(|since| since.elapsed() > self.max_in_flight)
                .unwrap_or(false);
            if quota.in_flight && abandoned {
                quota.count = quota.count.saturating_sub(1);
                quota.clear_in_flight();
                stats.released += 1;
            }
            true
        });

        stats
    }

    /// Run [`sweep`](Self::sweep) on a fixed interval
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let stats = self.sweep();
                if stats.removed > 0 || stats.released > 0 {
                    info!(
                        removed = stats.removed,
                        released = stats.released,
                        tracked = self.len(),
                        "Quota sweep"
                    );
                }
            }
        })
    }
}
