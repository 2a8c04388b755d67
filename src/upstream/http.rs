//! HTTP client for the separation service
//!
//! Every call carries `Authorization: <scheme> <api key>` (scheme defaults
//! to `license`). Wire format:
//!
//! | Operation | Request | Success body |
//! |-----------|---------|--------------|
//! | upload | `POST /api/upload/`, raw bytes, `Content-Disposition` filename | `{"status":"success","id":"…"}` |
//! | start_split | `POST /api/split/`, `{"id":"…","stem":"…"}` | `{"status":"success"}` |
//! | check_task | `GET /api/check/?id=…` | `{"status":"success","result":{"<id>":{"task":{"state":"…"},"split":{…}}}}` |
//!
//! A body with `"status":"error"` is reported as [`UpstreamError::Rejected`].

use super::{SeparationService, SplitAck, TaskState, TaskStatus, UpstreamError};
use crate::config::UpstreamConfig;
use crate::metrics;
use crate::stem::Stem;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{AUTHORIZATION, CONTENT_DISPOSITION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

const UPLOAD_PATH: &str = "/api/upload/";
const SPLIT_PATH: &str = "/api/split/";
const CHECK_PATH: &str = "/api/check/";

/// 80MB, the default upload cap
const DEFAULT_MAX_DOWNLOAD: u64 = 80 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    status: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SplitRequest<'a> {
    id: &'a str,
    stem: &'a str,
}

#[derive(Debug, Deserialize)]
struct SplitResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    status: String,
    #[serde(default)]
    result: HashMap<String, CheckEntry>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckEntry {
    #[serde(default)]
    task: Option<TaskInfo>,
    #[serde(default)]
    split: Option<SplitInfo>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    state: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SplitInfo {
    #[serde(default)]
    back_track: Option<String>,
    #[serde(default)]
    stem_track: Option<String>,
}

impl CheckEntry {
    fn into_status(self) -> TaskStatus {
        let state = match (&self.task, &self.split) {
            (Some(task), _) => TaskState::from_remote(&task.state),
            // Some deployments omit the task block once the split exists
            (None, Some(_)) => TaskState::Success,
            (None, None) if self.error.is_some() => TaskState::Error,
            (None, None) => TaskState::Queued,
        };

        let error = self
            .task
            .as_ref()
            .and_then(|t| t.error.clone())
            .or(self.error);
        let (back_track_url, stem_track_url) = match self.split {
            Some(split) => (split.back_track, split.stem_track),
            None => (None, None),
        };

        TaskStatus {
            state,
            back_track_url,
            stem_track_url,
            error,
        }
    }
}

/// Map a reqwest send failure onto the upstream taxonomy
fn transport_error(err: reqwest::Error) -> UpstreamError {
    UpstreamError::Transport(err.to_string())
}

/// Keep filenames header-safe
fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .chars()
        .filter(|c| !c.is_control() && *c != '"')
        .collect();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Separation service client over HTTP
pub struct HttpSeparationClient {
    base_url: String,
    auth_header: String,
    client: reqwest::Client,
    max_download: u64,
}

impl HttpSeparationClient {
    /// Create a new client
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        if config.api_key.trim().is_empty() {
            return Err(UpstreamError::Misconfigured(
                "separation service API key is not configured".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| UpstreamError::Misconfigured(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header: format!("{} {}", config.auth_scheme, config.api_key),
            client,
            max_download: DEFAULT_MAX_DOWNLOAD,
        })
    }

    /// Cap the size of downloaded result tracks
    pub fn with_max_download(mut self, bytes: u64) -> Self {
        self.max_download = bytes;
        self
    }

    /// Get the service base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fail on non-2xx, otherwise decode the JSON body
    async fn decode<T: serde::de::DeserializeOwned>(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<T, UpstreamError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            metrics::record_upstream_error(operation);
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response.json::<T>().await.map_err(|e| {
            metrics::record_upstream_error(operation);
            UpstreamError::Decode(e.to_string())
        })
    }
}

#[async_trait]
impl SeparationService for HttpSeparationClient {
    #[tracing::instrument(
        name = "upstream.upload",
        skip(self, body),
        fields(upload.bytes = body.len(), upstream.asset_id = tracing::field::Empty),
        err
    )]
    async fn upload(&self, body: Bytes, filename: &str) -> Result<String, UpstreamError> {
        let response = self
            .client
            .post(self.url(UPLOAD_PATH))
            .header(AUTHORIZATION, &self.auth_header)
            .header(
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", sanitize_filename(filename)),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| {
                metrics::record_upstream_error("upload");
                transport_error(e)
            })?;

        let parsed: UploadResponse = Self::decode("upload", response).await?;
        match (parsed.status.as_str(), parsed.id) {
            ("success", Some(id)) if !id.is_empty() => {
                tracing::Span::current().record("upstream.asset_id", id.as_str());
                Ok(id)
            }
            _ => Err(UpstreamError::Rejected(
                parsed
                    .error
                    .unwrap_or_else(|| "upload was not accepted".to_string()),
            )),
        }
    }

    #[tracing::instrument(name = "upstream.start_split", skip(self), fields(stem = %stem), err)]
    async fn start_split(&self, asset_id: &str, stem: Stem) -> Result<SplitAck, UpstreamError> {
        let response = self
            .client
            .post(self.url(SPLIT_PATH))
            .header(AUTHORIZATION, &self.auth_header)
            .json(&SplitRequest {
                id: asset_id,
                stem: stem.as_str(),
            })
            .send()
            .await
            .map_err(|e| {
                metrics::record_upstream_error("start_split");
                transport_error(e)
            })?;

        let parsed: SplitResponse = Self::decode("start_split", response).await?;
        let accepted = parsed.status == "success";
        debug!(accepted, "Split request acknowledged");

        Ok(SplitAck {
            accepted,
            message: parsed.error,
        })
    }

    #[tracing::instrument(name = "upstream.check_task", skip(self), err)]
    async fn check_task(&self, asset_id: &str) -> Result<TaskStatus, UpstreamError> {
        let response = self
            .client
            .get(self.url(CHECK_PATH))
            .header(AUTHORIZATION, &self.auth_header)
            .query(&[("id", asset_id)])
            .send()
            .await
            .map_err(|e| {
                metrics::record_upstream_error("check_task");
                transport_error(e)
            })?;

        let mut parsed: CheckResponse = Self::decode("check_task", response).await?;
        if parsed.status != "success" {
            return Err(UpstreamError::Rejected(
                parsed
                    .error
                    .unwrap_or_else(|| format!("check returned status '{}'", parsed.status)),
            ));
        }

        match parsed.result.remove(asset_id) {
            Some(entry) => Ok(entry.into_status()),
            None => {
                warn!(asset_id = %asset_id, "Asset missing from check result");
                Ok(TaskStatus::pending(TaskState::Queued))
            }
        }
    }

    #[tracing::instrument(name = "upstream.fetch_track", skip(self), err)]
    async fn fetch_track(&self, url: &str) -> Result<Bytes, UpstreamError> {
        // Result links are public; the API key is not sent to them
        let mut response = self.client.get(url).send().await.map_err(|e| {
            metrics::record_upstream_error("fetch_track");
            transport_error(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            metrics::record_upstream_error("fetch_track");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: String::new(),
            });
        }

        let limit = self.max_download;
        if response.content_length().is_some_and(|len| len > limit) {
            metrics::record_upstream_error("fetch_track");
            return Err(UpstreamError::TooLarge { limit });
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            if body.len() as u64 + chunk.len() as u64 > limit {
                metrics::record_upstream_error("fetch_track");
                return Err(UpstreamError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}
