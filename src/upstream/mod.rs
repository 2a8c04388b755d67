//! External separation service
//!
//! The proxy never separates audio itself. Everything it knows about a job
//! comes from the remote service through the [`SeparationService`] trait:
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | `upload` | Push file bytes, get the remote asset id (legacy path) |
//! | `start_split` | Ask the service to isolate one stem of an asset |
//! | `check_task` | Query the state of a split task |
//! | `fetch_track` | Download a finished track (legacy attachment delivery) |
//!
//! [`HttpSeparationClient`] is the production implementation.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::stem::Stem;

pub mod http;

pub use http::HttpSeparationClient;

/// Upstream errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Separation service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Client misconfigured: {0}")]
    Misconfigured(String),

    #[error("Response larger than {limit} bytes")]
    TooLarge { limit: u64 },
}

impl UpstreamError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Transport(_) => true,
            UpstreamError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Remote task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Processing,
    Success,
    Error,
    Cancelled,
}

impl TaskState {
    /// Parse the service's state string; unknown states count as still running
    pub fn from_remote(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" => TaskState::Queued,
            "success" | "done" | "completed" => TaskState::Success,
            "error" | "failed" => TaskState::Error,
            "cancelled" | "canceled" => TaskState::Cancelled,
            _ => TaskState::Processing,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Error | TaskState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Processing => "processing",
            TaskState::Success => "success",
            TaskState::Error => "error",
            TaskState::Cancelled => "cancelled",
        }
    }
}

/// State of a remote split task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub state: TaskState,
    /// Original audio with the selected stem removed
    pub back_track_url: Option<String>,
    /// The isolated stem alone
    pub stem_track_url: Option<String>,
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn pending(state: TaskState) -> Self {
        Self {
            state,
            back_track_url: None,
            stem_track_url: None,
            error: None,
        }
    }

    pub fn succeeded(back_track_url: &str, stem_track_url: &str) -> Self {
        Self {
            state: TaskState::Success,
            back_track_url: Some(back_track_url.to_string()),
            stem_track_url: Some(stem_track_url.to_string()),
            error: None,
        }
    }

    pub fn failed(state: TaskState, error: &str) -> Self {
        Self {
            state,
            back_track_url: None,
            stem_track_url: None,
            error: Some(error.to_string()),
        }
    }
}

/// Acknowledgement of a split request
#[derive(Debug, Clone, PartialEq)]
pub struct SplitAck {
    pub accepted: bool,
    pub message: Option<String>,
}

/// Remote audio separation service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SeparationService: Send + Sync {
    /// Upload audio bytes; returns the remote asset id
    async fn upload(&self, body: Bytes, filename: &str) -> Result<String, UpstreamError>;

    /// Start isolating `stem` from a previously uploaded asset
    async fn start_split(&self, asset_id: &str, stem: Stem) -> Result<SplitAck, UpstreamError>;

    /// Query the split task of an asset
    async fn check_task(&self, asset_id: &str) -> Result<TaskStatus, UpstreamError>;

    /// Download a finished track
    async fn fetch_track(&self, url: &str) -> Result<Bytes, UpstreamError>;
}
