// SPDX-License-Identifier: MIT

//! The HTTP face of the gateway.
//!
//! One POST route accepts an authenticated file upload — a multipart
//! form with a single file field, or a raw `application/octet-stream`
//! body with a `Content-Disposition` filename — runs the configured
//! signing backend against it in an isolated staging directory, and
//! encodes the outcome: signed bytes as an attachment, a verification
//! record as JSON, or the tool's captured output as a plain-text
//! failure.
//!
//! Each request is one task; isolation comes from per-request staging
//! directories, so no locking is involved anywhere on this path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::config::Config;
use crate::error::ServiceError;
use crate::signer::{self, SigningBackend, SigningOutcome};
use crate::staging::StagedFile;
use crate::validate::{CommandKind, ValidatedArgs};

/// Read-only state shared by all in-flight requests.
pub struct ServiceState {
    pub config: Arc<Config>,
    pub backend: Arc<dyn SigningBackend>,
}

/// Build the router serving the configured endpoint.
///
/// Exposed separately from [`listen`] so tests can drive the real
/// router with a backend of their choosing.
pub fn router(config: Arc<Config>, backend: Arc<dyn SigningBackend>) -> Router {
    let limit = config.max_upload_bytes;
    let endpoint = config.endpoint.clone();
    Router::new()
        .route(&endpoint, post(handle))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(Arc::new(ServiceState { config, backend }))
}

/// Bind the listener and serve until the given `halt_token` is
/// cancelled. Pending requests are allowed to complete before the
/// returned task finishes.
#[instrument(err, skip_all)]
pub fn listen(
    config: Config,
    halt_token: CancellationToken,
) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
    config.validate()?;
    let config = Arc::new(config);
    let backend = signer::from_config(
        &config.signer,
        Duration::from_secs(config.tool_timeout_secs.get()),
    );
    let app = router(Arc::clone(&config), backend);

    Ok(tokio::spawn(
        async move {
            let listener = tokio::net::TcpListener::bind(config.listen)
                .await
                .with_context(|| format!("Failed to bind to {}", config.listen))?;
            tracing::info!(address = %config.listen, endpoint = %config.endpoint, "Listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(halt_token.cancelled_owned())
                .await
                .context("HTTP listener failed")?;
            tracing::info!("Shutdown complete");
            Ok(())
        }
        .instrument(tracing::Span::current()),
    ))
}

/// Process a single signing request.
///
/// Authentication happens before anything else; a rejected credential
/// means no file is written and no process is spawned. The rest of
/// the pipeline is wrapped in the configured timeout so a stuck tool
/// cannot hold the staging directory forever.
#[instrument(skip_all, fields(request_id = uuid::Uuid::now_v7().to_string()))]
async fn handle(State(state): State<Arc<ServiceState>>, request: Request) -> Response {
    if let Err(error) = authorize(&state.config, request.headers()) {
        return error.into_response();
    }

    let timeout = Duration::from_secs(state.config.request_timeout_secs.get());
    match tokio::time::timeout(timeout, process(state, request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => {
            tracing::warn!(%error, "Request failed");
            error.into_response()
        }
        Err(_) => {
            tracing::error!("Request handler timed out");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn process(
    state: Arc<ServiceState>,
    request: Request,
) -> Result<Response, ServiceError> {
    let mut query = parse_query(request.uri().query().unwrap_or_default())?;
    let command = CommandKind::parse(&query.remove("command").unwrap_or_default())?;
    let args = ValidatedArgs::from_query(&query)?;

    let upload = receive_upload(request, state.config.max_upload_bytes).await?;
    tracing::info!(
        file = %upload.file_name,
        bytes = upload.bytes.len(),
        command = command.verb(),
        "Upload received"
    );

    // Dropped on every exit path below, which removes the per-request
    // directory and the staged file with it.
    let staged = StagedFile::create(
        &state.config.staging_root,
        &upload.file_name,
        &upload.bytes,
    )
    .await?;

    let outcome = state.backend.run(command, &args, &staged).await?;
    Ok(encode_outcome(outcome, &staged))
}

/// Compare the authorization header against the accepted set.
///
/// The comparison is an exact match of the full header value against
/// any configured credential; the error carries only the configured
/// challenge, never a hint about what was presented.
fn authorize(config: &Config, headers: &HeaderMap) -> Result<(), ServiceError> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let accepted = presented
        .map(|value| config.authorized.iter().any(|known| known == value))
        .unwrap_or(false);

    if accepted {
        Ok(())
    } else {
        tracing::warn!("Rejecting request with a missing or unknown credential");
        Err(ServiceError::Unauthorized {
            challenge: format!("{} realm=\"{}\"", config.scheme, config.realm),
        })
    }
}

fn parse_query(raw: &str) -> Result<HashMap<String, String>, ServiceError> {
    let mut query = HashMap::new();
    for (name, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        if query
            .insert(name.to_string(), value.to_string())
            .is_some()
        {
            return Err(ServiceError::InvalidArgument {
                name: name.to_string(),
                value: value.to_string(),
                reason: "repeated query parameter".to_string(),
            });
        }
    }
    Ok(query)
}

struct Upload {
    file_name: String,
    bytes: Bytes,
}

/// Accept exactly one uploaded file from the request body.
async fn receive_upload(request: Request, limit: usize) -> Result<Upload, ServiceError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if media_type == "multipart/form-data" {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|error| ServiceError::MalformedUpload(error.to_string()))?;
        let mut upload = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|error| ServiceError::MalformedUpload(error.to_string()))?
        {
            let Some(file_name) = field.file_name().map(ToString::to_string) else {
                // Plain value fields are not part of this protocol.
                continue;
            };
            if upload.is_some() {
                return Err(ServiceError::MalformedUpload(
                    "more than one file in the form".to_string(),
                ));
            }
            let bytes = field
                .bytes()
                .await
                .map_err(|error| ServiceError::MalformedUpload(error.to_string()))?;
            upload = Some(Upload { file_name, bytes });
        }
        upload.ok_or_else(|| ServiceError::MalformedUpload("no file in the form".to_string()))
    } else if media_type == "application/octet-stream" {
        let file_name = attachment_filename(request.headers()).ok_or_else(|| {
            ServiceError::MalformedUpload(
                "octet-stream uploads need a content-disposition filename".to_string(),
            )
        })?;
        let bytes = axum::body::to_bytes(request.into_body(), limit)
            .await
            .map_err(|error| ServiceError::MalformedUpload(error.to_string()))?;
        Ok(Upload { file_name, bytes })
    } else {
        Err(ServiceError::MalformedUpload(format!(
            "content type {content_type:?} should be multipart form data or application/octet-stream"
        )))
    }
}

/// Pull the filename out of a `Content-Disposition` header.
fn attachment_filename(headers: &HeaderMap) -> Option<String> {
    let disposition = headers
        .get(header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    for part in disposition.split(';') {
        if let Some(name) = part.trim().strip_prefix("filename=") {
            let name = name.trim().trim_matches('"');
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Encode a signing outcome onto the wire.
///
/// Signed bytes stream back as an attachment named after the original
/// upload; a verification record is JSON with its field order
/// preserved; a tool failure is a 500 carrying the tool's own words
/// so the caller can tell "ran and said no" from "could not run".
fn encode_outcome(outcome: SigningOutcome, staged: &StagedFile) -> Response {
    match outcome {
        SigningOutcome::Signed { bytes } => (
            [
                (
                    header::CONTENT_TYPE,
                    "application/octet-stream".to_string(),
                ),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", staged.file_name()),
                ),
            ],
            bytes,
        )
            .into_response(),
        SigningOutcome::Verified(record) => Json(record).into_response(),
        SigningOutcome::ToolFailed {
            exit_code,
            stdout,
            stderr,
        } => {
            tracing::warn!(exit_code, "Returning tool failure to the caller");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{stdout}{stderr}"),
            )
                .into_response()
        }
    }
}
