//! Metrics module
//!
//! Provides Prometheus metrics for requests, quota decisions and remote jobs.

pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, CounterVec, Histogram,
    HistogramVec,
};

lazy_static! {
    // Request metrics
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "stemproxy_requests_total",
        "Total number of proxy requests",
        &["action", "status"]
    ).unwrap();

    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "stemproxy_request_duration_seconds",
        "Request duration in seconds",
        &["action"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 300.0]
    ).unwrap();

    // Quota metrics
    pub static ref QUOTA_REJECTIONS: CounterVec = register_counter_vec!(
        "stemproxy_quota_rejections_total",
        "Uploads refused by the quota store",
        &["reason"]  // "in_flight" or "limit_reached"
    ).unwrap();

    // Job metrics
    pub static ref JOBS_TOTAL: CounterVec = register_counter_vec!(
        "stemproxy_jobs_total",
        "Separation jobs by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref JOB_DURATION: Histogram = register_histogram!(
        "stemproxy_job_duration_seconds",
        "Time from split start to terminal state",
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    pub static ref POLL_ATTEMPTS: CounterVec = register_counter_vec!(
        "stemproxy_poll_attempts_total",
        "Remote task status queries by observed state",
        &["state"]
    ).unwrap();

    // Upstream metrics
    pub static ref UPSTREAM_ERRORS: CounterVec = register_counter_vec!(
        "stemproxy_upstream_errors_total",
        "Failed calls to the separation service",
        &["operation"]
    ).unwrap();
}

/// Record a handled request
pub fn record_request(action: &str, status: u16, duration_secs: f64) {
    REQUESTS_TOTAL
        .with_label_values(&[action, &status.to_string()])
        .inc();
    REQUEST_DURATION
        .with_label_values(&[action])
        .observe(duration_secs);
}

/// Record a quota refusal
pub fn record_quota_rejection(reason: &str) {
    QUOTA_REJECTIONS.with_label_values(&[reason]).inc();
}

/// Record how a job ended
pub fn record_job_outcome(outcome: &str) {
    JOBS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record the wall time of a synchronously polled job
pub fn observe_job_duration(duration_secs: f64) {
    JOB_DURATION.observe(duration_secs);
}

/// Record one status query
pub fn record_poll_attempt(state: &str) {
    POLL_ATTEMPTS.with_label_values(&[state]).inc();
}

/// Record a failed upstream call
pub fn record_upstream_error(operation: &str) {
    UPSTREAM_ERRORS.with_label_values(&[operation]).inc();
}
