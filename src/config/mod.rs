//! Configuration module for Stem Proxy
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation. Every numeric limit used by
//! the quota, authorization and polling logic lives here with a documented
//! default, so none of them are hard-coded in the core.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("SEPARATOR_KEY", "abc");
/// assert_eq!(expand_env_vars("license ${SEPARATOR_KEY}"), "license abc");
/// assert_eq!(expand_env_vars("${MISSING:-fallback}"), "fallback");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);

    result
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upper bound for upload ticket lifetimes (one week)
pub const MAX_CREDENTIAL_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Parse configuration from a YAML string (environment variables are expanded)
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        ConfigLoader::parse(content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "server.address cannot be empty".into(),
            ));
        }

        if !is_valid_http_url(&self.upstream.base_url) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid upstream.base_url '{}': must start with http:// or https://",
                self.upstream.base_url
            )));
        }

        if self.upstream.api_key.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "upstream.api_key must be set".into(),
            ));
        }

        if self.upstream.upload_signing_secret.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "upstream.upload_signing_secret must be set".into(),
            ));
        }

        if self.limits.daily_limit == 0 {
            return Err(ConfigError::ValidationError(
                "limits.daily_limit must be greater than 0".into(),
            ));
        }

        if self.limits.max_file_size == 0 {
            return Err(ConfigError::ValidationError(
                "limits.max_file_size must be greater than 0".into(),
            ));
        }

        if self.poll.max_attempts == 0 || self.poll.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll.max_attempts and poll.interval_ms must be greater than 0".into(),
            ));
        }

        if self.quota.sweep_interval_seconds == 0 || self.jobs.sweep_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "quota.sweep_interval_seconds and jobs.sweep_interval_seconds must be greater than 0"
                    .into(),
            ));
        }

        if self.upstream.credential_ttl_seconds == 0
            || self.upstream.credential_ttl_seconds > MAX_CREDENTIAL_TTL_SECONDS
        {
            return Err(ConfigError::ValidationError(format!(
                "upstream.credential_ttl_seconds must be between 1 and {}",
                MAX_CREDENTIAL_TTL_SECONDS
            )));
        }

        if self.jobs.ttl_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "jobs.ttl_seconds must be greater than 0".into(),
            ));
        }

        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid logging.format '{}': must be 'json' or 'pretty'",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// How `process` requests are completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Block the request until the remote task reaches a terminal state
    #[default]
    Sync,
    /// Return immediately; clients poll with `check_status`
    Deferred,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    #[serde(default = "default_cors_allow_origin")]
    pub cors_allow_origin: String,
    /// Take the client identity from `X-Forwarded-For` / `X-Real-IP`
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    #[serde(default)]
    pub mode: ProcessingMode,
}

fn default_cors_allow_origin() -> String {
    "*".to_string()
}

/// External separation service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
    /// Authorization scheme prefixed to the key. Default: "license"
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,
    /// Secret shared with the separation service for presigned upload tickets
    pub upload_signing_secret: String,
    #[serde(default = "default_credential_ttl")]
    pub credential_ttl_seconds: u64,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_seconds)
    }
}

fn default_auth_scheme() -> String {
    "license".to_string()
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_credential_ttl() -> u64 {
    900
}

/// Upload limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_max_duration")]
    pub max_duration_seconds: f64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            max_file_size: default_max_file_size(),
            max_duration_seconds: default_max_duration(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

fn default_daily_limit() -> u32 {
    3
}

fn default_max_file_size() -> u64 {
    83886080 // 80MB
}

fn default_max_duration() -> f64 {
    300.0
}

fn default_allowed_extensions() -> Vec<String> {
    ["mp3", "wav", "m4a", "flac", "ogg"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Quota store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Identities that bypass every limit
    #[serde(default)]
    pub exempt: Vec<String>,
    #[serde(default = "default_quota_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Reservations older than this are released by the sweep
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_seconds: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            exempt: Vec::new(),
            sweep_interval_seconds: default_quota_sweep_interval(),
            max_in_flight_seconds: default_max_in_flight(),
        }
    }
}

fn default_quota_sweep_interval() -> u64 {
    3600
}

fn default_max_in_flight() -> u64 {
    900
}

/// Poll loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_poll_attempts")]
    pub max_attempts: u32,
    /// Consecutive transport failures tolerated before giving up
    #[serde(default = "default_transport_failures")]
    pub max_transport_failures: u32,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            max_attempts: default_poll_attempts(),
            max_transport_failures: default_transport_failures(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_poll_attempts() -> u32 {
    150
}

fn default_transport_failures() -> u32 {
    5
}

fn default_max_backoff() -> u64 {
    30000
}

/// Deferred job table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Inactivity window after which a deferred job is dropped
    #[serde(default = "default_job_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_job_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_job_ttl(),
            sweep_interval_seconds: default_job_sweep_interval(),
        }
    }
}

fn default_job_ttl() -> u64 {
    600
}

fn default_job_sweep_interval() -> u64 {
    60
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}
