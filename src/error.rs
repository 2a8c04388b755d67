//! Proxy error taxonomy
//!
//! Every failure the HTTP surface can report maps to one [`ErrorKind`], which
//! fixes the status code and the machine-readable `error` field. The
//! finer-grained `reason` lets the client widget tell e.g. a bad stem from a
//! missing field without parsing messages.

use crate::upstream::UpstreamError;
use hyper::StatusCode;
use thiserror::Error;

/// Coarse error classes exposed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    QuotaExceeded,
    AlreadyProcessing,
    PayloadTooLarge,
    DurationExceeded,
    NotFound,
    MethodNotAllowed,
    UpstreamInitializationFailed,
    UpstreamTaskFailed,
    UpstreamTimeout,
    Misconfiguration,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::AlreadyProcessing => "already_processing",
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::DurationExceeded => "duration_exceeded",
            ErrorKind::NotFound => "not_found",
            ErrorKind::MethodNotAllowed => "method_not_allowed",
            ErrorKind::UpstreamInitializationFailed => "upstream_initialization_failed",
            ErrorKind::UpstreamTaskFailed => "upstream_task_failed",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::Misconfiguration => "misconfiguration",
            ErrorKind::Unexpected => "unexpected",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::QuotaExceeded | ErrorKind::AlreadyProcessing => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ErrorKind::PayloadTooLarge | ErrorKind::DurationExceeded => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorKind::UpstreamInitializationFailed | ErrorKind::UpstreamTaskFailed => {
                StatusCode::BAD_GATEWAY
            }
            ErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Misconfiguration | ErrorKind::Unexpected => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Proxy errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Unsupported stem '{0}'")]
    InvalidStem(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    #[error("No upload was authorized for this client")]
    NoReservation,

    #[error("Daily limit reached")]
    QuotaExceeded { remaining: u32 },

    #[error("A separation job is already running for this client")]
    AlreadyProcessing { remaining: u32 },

    #[error("File is {size} bytes, the maximum is {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Audio is {duration:.0} seconds long, the maximum is {max:.0} seconds")]
    DurationExceeded { duration: f64, max: f64 },

    #[error("Job not found or expired")]
    NotFound,

    #[error("Method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("Separation service refused to start: {message}")]
    InitializationFailed { message: String, remaining: u32 },

    #[error("Separation failed: {message}")]
    ProcessingFailed { message: String, remaining: u32 },

    #[error("Separation did not finish after {attempts} status checks")]
    ProcessingTimeout { attempts: u32, remaining: u32 },

    #[error("Server misconfiguration: {0}")]
    Misconfiguration(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl ProxyError {
    /// Client-facing error class
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::InvalidStem(_)
            | ProxyError::MissingField(_)
            | ProxyError::UnsupportedFormat(_)
            | ProxyError::InvalidBody(_)
            | ProxyError::UnknownAction(_)
            | ProxyError::NoReservation => ErrorKind::Validation,
            ProxyError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            ProxyError::AlreadyProcessing { .. } => ErrorKind::AlreadyProcessing,
            ProxyError::FileTooLarge { .. } => ErrorKind::PayloadTooLarge,
            ProxyError::DurationExceeded { .. } => ErrorKind::DurationExceeded,
            ProxyError::NotFound => ErrorKind::NotFound,
            ProxyError::MethodNotAllowed(_) => ErrorKind::MethodNotAllowed,
            ProxyError::InitializationFailed { .. } => ErrorKind::UpstreamInitializationFailed,
            ProxyError::ProcessingFailed { .. } => ErrorKind::UpstreamTaskFailed,
            ProxyError::ProcessingTimeout { .. } => ErrorKind::UpstreamTimeout,
            ProxyError::Misconfiguration(_) => ErrorKind::Misconfiguration,
            ProxyError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Finer-grained reason code
    pub fn reason(&self) -> &'static str {
        match self {
            ProxyError::InvalidStem(_) => "invalid_stem",
            ProxyError::MissingField(_) => "missing_field",
            ProxyError::UnsupportedFormat(_) => "unsupported_format",
            ProxyError::InvalidBody(_) => "invalid_body",
            ProxyError::UnknownAction(_) => "unknown_action",
            ProxyError::NoReservation => "no_reservation",
            ProxyError::QuotaExceeded { .. } => "limit_reached",
            ProxyError::AlreadyProcessing { .. } => "in_flight",
            ProxyError::FileTooLarge { .. } => "file_too_large",
            ProxyError::DurationExceeded { .. } => "duration_exceeded",
            ProxyError::NotFound => "not_found",
            ProxyError::MethodNotAllowed(_) => "method_not_allowed",
            ProxyError::InitializationFailed { .. } => "initialization_failed",
            ProxyError::ProcessingFailed { .. } => "processing_failed",
            ProxyError::ProcessingTimeout { .. } => "processing_timeout",
            ProxyError::Misconfiguration(_) => "misconfiguration",
            ProxyError::Unexpected(_) => "unexpected",
        }
    }

    /// Remaining daily quota, where the error concerns quota
    pub fn remaining(&self) -> Option<u32> {
        match self {
            ProxyError::QuotaExceeded { remaining }
            | ProxyError::AlreadyProcessing { remaining }
            | ProxyError::InitializationFailed { remaining, .. }
            | ProxyError::ProcessingFailed { remaining, .. }
            | ProxyError::ProcessingTimeout { remaining, .. } => Some(*remaining),
            _ => None,
        }
    }

    /// Human-readable message for the client widget
    pub fn user_message(&self) -> String {
        match self.remaining() {
            Some(remaining) if self.kind() != ErrorKind::QuotaExceeded => format!(
                "{}. You have {} separation{} left today.",
                self,
                remaining,
                if remaining == 1 { "" } else { "s" }
            ),
            Some(_) => format!("{}. Please try again tomorrow.", self),
            None => self.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind().status_code()
    }
}

impl From<UpstreamError> for ProxyError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Misconfigured(msg) => ProxyError::Misconfiguration(msg),
            other => ProxyError::Unexpected(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_kind() {
        assert_eq!(
            ProxyError::InvalidStem("saxophone".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::AlreadyProcessing { remaining: 2 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ProxyError::FileTooLarge { size: 2, max: 1 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ProxyError::ProcessingFailed {
                message: "boom".into(),
                remaining: 3
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::ProcessingTimeout {
                attempts: 150,
                remaining: 3
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::Misconfiguration("no key".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_invalid_stem_is_validation() {
        let err = ProxyError::InvalidStem("saxophone".into());
        assert_eq!(err.kind().as_str(), "validation");
        assert_eq!(err.reason(), "invalid_stem");
        assert_eq!(err.remaining(), None);
    }

    #[test]
    fn test_user_message_mentions_remaining() {
        let err = ProxyError::ProcessingFailed {
            message: "task error".into(),
            remaining: 1,
        };
        let msg = err.user_message();
        assert!(msg.contains("1 separation left"), "got: {}", msg);
    }

    #[test]
    fn test_quota_message_suggests_tomorrow() {
        let msg = ProxyError::QuotaExceeded { remaining: 0 }.user_message();
        assert!(msg.contains("tomorrow"), "got: {}", msg);
    }
}
