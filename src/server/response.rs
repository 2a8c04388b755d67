//! Response bodies and builders
//!
//! Every response is JSON except the attachment delivery of a processed
//! track, and every response carries the CORS headers the browser widget
//! needs.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_DISPOSITION, CONTENT_TYPE,
};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::authorizer::UploadCredential;
use crate::error::ProxyError;
use crate::orchestrator::SeparationResult;
use crate::quota::{QuotaCheck, QuotaDenial};

pub type ProxyResponse = Response<Full<Bytes>>;

/// `check_limit` answer
#[derive(Debug, Serialize)]
pub struct LimitBody {
    pub ok: bool,
    pub allowed: bool,
    pub remaining: u32,
    pub count: u32,
    pub limit: u32,
    pub in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<QuotaDenial>,
}

impl LimitBody {
    pub fn new(check: QuotaCheck, limit: u32) -> Self {
        Self {
            ok: true,
            allowed: check.allowed,
            remaining: check.remaining,
            count: check.count,
            limit,
            in_flight: check.in_flight,
            reason: check.reason,
        }
    }
}

/// Authorized direct upload
#[derive(Debug, Serialize)]
pub struct CredentialBody {
    pub ok: bool,
    pub remaining: u32,
    pub credential: UploadCredential,
}

/// Upload forwarded through the proxy
#[derive(Debug, Serialize)]
pub struct UploadBody {
    pub ok: bool,
    #[serde(rename = "uploadId")]
    pub upload_id: String,
    pub remaining: u32,
}

/// Finished separation
#[derive(Debug, Serialize)]
pub struct CompletedBody {
    pub ok: bool,
    pub back_track_url: String,
    pub stem_track_url: String,
    pub stem: &'static str,
    pub stem_label: &'static str,
    pub remaining: u32,
}

impl From<SeparationResult> for CompletedBody {
    fn from(result: SeparationResult) -> Self {
        Self {
            ok: true,
            back_track_url: result.back_track_url,
            stem_track_url: result.stem_track_url,
            stem: result.stem.as_str(),
            stem_label: result.stem.label(),
            remaining: result.remaining,
        }
    }
}

/// Job still running
#[derive(Debug, Serialize)]
pub struct ProcessingBody {
    pub ok: bool,
    pub processing: bool,
    #[serde(rename = "uploadId", skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    ok: bool,
    error: &'static str,
    reason: &'static str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<u32>,
}

/// Builds responses carrying the configured CORS origin
#[derive(Debug, Clone)]
pub struct Responder {
    allow_origin: HeaderValue,
}

impl Responder {
    pub fn new(allow_origin: &str) -> Self {
        Self {
            allow_origin: HeaderValue::from_str(allow_origin)
                .unwrap_or_else(|_| HeaderValue::from_static("*")),
        }
    }

    fn with_cors(&self, mut response: ProxyResponse) -> ProxyResponse {
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST, OPTIONS"),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        );
        response
    }

    fn raw(&self, status: StatusCode, content_type: &'static str, body: Bytes) -> ProxyResponse {
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.with_cors(response)
    }

    /// Serialize `body` as JSON
    pub fn json<T: Serialize>(&self, status: StatusCode, body: &T) -> ProxyResponse {
        match serde_json::to_vec(body) {
            Ok(bytes) => self.raw(status, "application/json", Bytes::from(bytes)),
            Err(e) => {
                error!(error = %e, "Failed to serialize response");
                self.raw(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "application/json",
                    Bytes::from_static(
                        br#"{"ok":false,"error":"unexpected","reason":"unexpected","message":"Failed to serialize response"}"#,
                    ),
                )
            }
        }
    }

    pub fn ok<T: Serialize>(&self, body: &T) -> ProxyResponse {
        self.json(StatusCode::OK, body)
    }

    pub fn error(&self, err: &ProxyError) -> ProxyResponse {
        let message = err.user_message();
        self.json(
            err.status_code(),
            &ErrorBody {
                ok: false,
                error: err.kind().as_str(),
                reason: err.reason(),
                message: &message,
                remaining: err.remaining(),
            },
        )
    }

    /// Empty 200 for CORS preflight
    pub fn preflight(&self) -> ProxyResponse {
        self.with_cors(Response::new(Full::new(Bytes::new())))
    }

    pub fn health(&self) -> ProxyResponse {
        self.raw(StatusCode::OK, "text/plain", Bytes::from_static(b"ok"))
    }

    /// Processed audio delivered as a download
    pub fn attachment(&self, body: Bytes, filename: &str) -> ProxyResponse {
        let mut response = self.raw(StatusCode::OK, "audio/mpeg", body);
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        {
            response.headers_mut().insert(CONTENT_DISPOSITION, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: ProxyResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let responder = Responder::new("*");
        let response = responder.error(&ProxyError::ProcessingFailed {
            message: "task error".into(),
            remaining: 2,
        });
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );

        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "upstream_task_failed");
        assert_eq!(body["reason"], "processing_failed");
        assert_eq!(body["remaining"], 2);
    }

    #[tokio::test]
    async fn test_validation_error_omits_remaining() {
        let response = Responder::new("*").error(&ProxyError::InvalidStem("saxophone".into()));
        let body = body_json(response).await;
        assert!(body.get("remaining").is_none());
        assert_eq!(body["error"], "validation");
    }

    #[test]
    fn test_preflight_has_cors_headers() {
        let response = Responder::new("https://music.example").preflight();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://music.example"
        );
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
            "POST, OPTIONS"
        );
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "Content-Type"
        );
    }

    #[test]
    fn test_attachment_headers() {
        let response = Responder::new("*").attachment(Bytes::from_static(b"ID3"), "processed_1.mp3");
        assert_eq!(
            response.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"processed_1.mp3\""
        );
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "audio/mpeg");
    }
}
