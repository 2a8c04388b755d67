//! Request dispatch
//!
//! The widget talks to a single URL and selects the operation with an
//! `action` field, sent either as JSON or as a `multipart/form-data` form
//! (the form variant may carry the audio file itself).
//!
//! | Method | Result |
//! |--------|--------|
//! | `POST` | action dispatch |
//! | `OPTIONS` | empty 200 (CORS preflight) |
//! | `GET /health` | `ok` |
//! | anything else | 405 |

use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::identity::resolve_identity;
use super::response::{
    CompletedBody, CredentialBody, LimitBody, ProcessingBody, ProxyResponse, UploadBody,
};
use super::App;
use crate::error::ProxyError;
use crate::metrics;
use crate::orchestrator::SplitOutcome;
use crate::status::{processing_message, StatusReport};

/// Multipart and JSON framing overhead allowed on top of the file size cap
const BODY_OVERHEAD: u64 = 1024 * 1024;

/// Operations selectable through `action`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CheckLimit,
    Upload,
    Process,
    CheckStatus,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CheckLimit => "check_limit",
            Action::Upload => "upload",
            Action::Process => "process",
            Action::CheckStatus => "check_status",
        }
    }
}

impl FromStr for Action {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "check_limit" => Ok(Action::CheckLimit),
            "upload" => Ok(Action::Upload),
            "process" => Ok(Action::Process),
            "check_status" => Ok(Action::CheckStatus),
            other => Err(ProxyError::UnknownAction(other.to_string())),
        }
    }
}

/// Fields shared by every action
#[derive(Debug, Default, Deserialize)]
pub struct ActionFields {
    pub action: Option<String>,
    #[serde(rename = "uploadId", alias = "upload_id")]
    pub upload_id: Option<String>,
    pub stem: Option<String>,
    pub filename: Option<String>,
    pub size: Option<u64>,
    pub duration: Option<f64>,
    #[serde(default)]
    pub download: bool,
}

/// File part of a multipart request
#[derive(Debug)]
pub struct UploadedFile {
    pub filename: Option<String>,
    pub data: Bytes,
}

/// Parsed request
#[derive(Debug)]
pub struct ActionRequest {
    pub action: Action,
    pub fields: ActionFields,
    pub file: Option<UploadedFile>,
}

fn flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn set_form_field(fields: &mut ActionFields, name: &str, value: String) -> Result<(), ProxyError> {
    match name {
        "action" => fields.action = Some(value),
        "uploadId" | "upload_id" => fields.upload_id = Some(value),
        "stem" => fields.stem = Some(value),
        "filename" => fields.filename = Some(value),
        "size" => {
            fields.size = Some(value.trim().parse().map_err(|_| {
                ProxyError::InvalidBody(format!("size '{}' is not a byte count", value))
            })?)
        }
        "duration" => {
            let duration = value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite() && *d >= 0.0)
                .ok_or_else(|| {
                    ProxyError::InvalidBody(format!("duration '{}' is not a number", value))
                })?;
            fields.duration = Some(duration);
        }
        "download" => fields.download = flag(&value),
        other => debug!(field = %other, "Ignoring unknown form field"),
    }
    Ok(())
}

async fn parse_multipart(
    body: Bytes,
    content_type: &str,
) -> Result<(ActionFields, Option<UploadedFile>), ProxyError> {
    let boundary =
        multer::parse_boundary(content_type).map_err(|e| ProxyError::InvalidBody(e.to_string()))?;
    let stream = futures::stream::once(async move { Ok::<Bytes, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = ActionFields::default();
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ProxyError::InvalidBody(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let filename = field.file_name().map(str::to_string);
            let data = field
                .bytes()
                .await
                .map_err(|e| ProxyError::InvalidBody(e.to_string()))?;
            file = Some(UploadedFile { filename, data });
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ProxyError::InvalidBody(e.to_string()))?;
            set_form_field(&mut fields, &name, value)?;
        }
    }

    Ok((fields, file))
}

/// Read the body under a size cap
async fn read_body<B>(body: B, limit: u64, max_file_size: u64) -> Result<Bytes, ProxyError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let limited = Limited::new(body, usize::try_from(limit).unwrap_or(usize::MAX));
    match limited.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(ProxyError::FileTooLarge {
            size: limit + 1,
            max: max_file_size,
        }),
        Err(e) => Err(ProxyError::InvalidBody(e.to_string())),
    }
}

/// Decode a POST body into an action request
pub async fn parse_request<B>(req: Request<B>, max_file_size: u64) -> Result<ActionRequest, ProxyError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let limit = max_file_size.saturating_add(BODY_OVERHEAD);
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(declared) = declared.filter(|d| *d > limit) {
        return Err(ProxyError::FileTooLarge {
            size: declared,
            max: max_file_size,
        });
    }

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = read_body(req.into_body(), limit, max_file_size).await?;

    let (fields, file) = if content_type.starts_with("multipart/form-data") {
        parse_multipart(body, &content_type).await?
    } else {
        if body.is_empty() {
            return Err(ProxyError::InvalidBody("empty request body".into()));
        }
        let fields: ActionFields =
            serde_json::from_slice(&body).map_err(|e| ProxyError::InvalidBody(e.to_string()))?;
        (fields, None)
    };

    let action = fields
        .action
        .as_deref()
        .ok_or(ProxyError::MissingField("action"))?
        .parse()?;

    Ok(ActionRequest {
        action,
        fields,
        file,
    })
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, ProxyError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ProxyError::MissingField(name))
}

async fn dispatch(app: &App, identity: &str, request: ActionRequest) -> Result<ProxyResponse, ProxyError> {
    let responder = &app.responder;
    let ActionRequest {
        action,
        fields,
        file,
    } = request;

    match action {
        Action::CheckLimit => {
            let check = app.quota.check(identity);
            Ok(responder.ok(&LimitBody::new(check, app.quota.daily_limit())))
        }

        Action::Upload => match file {
            Some(file) => {
                let filename = file
                    .filename
                    .as_deref()
                    .or(fields.filename.as_deref())
                    .unwrap_or_default()
                    .to_string();
                let receipt = app
                    .authorizer
                    .authorize_and_upload(identity, &filename, fields.duration, file.data)
                    .await?;
                Ok(responder.ok(&UploadBody {
                    ok: true,
                    upload_id: receipt.upload_id,
                    remaining: receipt.remaining,
                }))
            }
            None => {
                let filename = required(&fields.filename, "filename")?;
                let size = fields.size.ok_or(ProxyError::MissingField("size"))?;
                let authorization =
                    app.authorizer
                        .authorize(identity, filename, size, fields.duration)?;
                Ok(responder.ok(&CredentialBody {
                    ok: true,
                    remaining: authorization.remaining,
                    credential: authorization.credential,
                }))
            }
        },

        Action::Process => {
            let upload_id = required(&fields.upload_id, "uploadId")?;
            let stem = required(&fields.stem, "stem")?;
            let outcome = app
                .orchestrator
                .start_split(identity, upload_id, stem, app.mode)
                .await?;

            match outcome {
                SplitOutcome::Completed(result) if fields.download => {
                    let audio = app
                        .orchestrator
                        .fetch_track(identity, &result.back_track_url)
                        .await?;
                    let filename = format!("processed_{}.mp3", chrono::Utc::now().timestamp());
                    Ok(responder.attachment(audio, &filename))
                }
                SplitOutcome::Completed(result) => Ok(responder.ok(&CompletedBody::from(result))),
                SplitOutcome::Pending {
                    upload_id,
                    stem,
                    remaining,
                } => Ok(responder.ok(&ProcessingBody {
                    ok: true,
                    processing: true,
                    upload_id: Some(upload_id),
                    message: processing_message(stem),
                    remaining: Some(remaining),
                })),
            }
        }

        Action::CheckStatus => {
            let upload_id = required(&fields.upload_id, "uploadId")?;
            match app.status.check_status(upload_id).await? {
                StatusReport::Completed(result) => Ok(responder.ok(&CompletedBody::from(result))),
                StatusReport::Processing { message } => Ok(responder.ok(&ProcessingBody {
                    ok: true,
                    processing: true,
                    upload_id: None,
                    message,
                    remaining: None,
                })),
            }
        }
    }
}

/// Handle one HTTP request
pub async fn handle_request<B>(
    req: Request<B>,
    peer: SocketAddr,
    app: Arc<App>,
) -> Result<ProxyResponse, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let started = Instant::now();
    let method = req.method().clone();

    match method {
        Method::OPTIONS => return Ok(app.responder.preflight()),
        Method::GET if req.uri().path() == "/health" => return Ok(app.responder.health()),
        Method::POST => {}
        other => {
            let response = app
                .responder
                .error(&ProxyError::MethodNotAllowed(other.to_string()));
            metrics::record_request("none", response.status().as_u16(), 0.0);
            return Ok(response);
        }
    }

    let identity = resolve_identity(req.headers(), peer, app.trust_forwarded);
    let (action, response) = match parse_request(req, app.max_file_size).await {
        Ok(request) => {
            let action = request.action.as_str();
            let response = match dispatch(&app, &identity, request).await {
                Ok(response) => response,
                Err(e) => app.responder.error(&e),
            };
            (action, response)
        }
        Err(e) => ("invalid", app.responder.error(&e)),
    };

    let status = response.status().as_u16();
    info!(
        identity = %identity,
        action,
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request handled"
    );
    metrics::record_request(action, status, started.elapsed().as_secs_f64());
    Ok(response)
}
