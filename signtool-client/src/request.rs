// SPDX-License-Identifier: MIT

//! Building and submitting signing requests to the gateway.

use std::path::{Path, PathBuf};

use reqwest::header;
use reqwest::multipart::{Form, Part};

use crate::config::Config;
use crate::render::{self, VerifyRecord};
use crate::{EXIT_SUCCESS, EXIT_TOOL_FAILURE, EXIT_TRANSPORT, EXIT_USAGE};

/// Arguments shared by the `sign` and `verify` subcommands.
#[derive(Debug, Clone, clap::Args)]
pub struct JobArgs {
    /// Flag-style options to pass to the signing tool, e.g. `-o q -o a`.
    #[arg(long = "option", short = 'o')]
    pub options: Vec<String>,

    /// Thumbprint of the signing certificate.
    #[arg(long)]
    pub sha1: Option<String>,

    /// File digest algorithm.
    #[arg(long)]
    pub fd: Option<String>,

    /// Default digest algorithm for the whole operation.
    #[arg(long)]
    pub td: Option<String>,

    /// Timestamp server URL (legacy protocol).
    #[arg(long)]
    pub t: Option<String>,

    /// RFC 3161 timestamp server URL.
    #[arg(long)]
    pub tr: Option<String>,

    /// Files to upload, one request per file.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

impl JobArgs {
    /// Keyed arguments in the order the gateway expects them.
    pub fn keyed(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("td", self.td.as_deref()),
            ("sha1", self.sha1.as_deref()),
            ("fd", self.fd.as_deref()),
            ("t", self.t.as_deref()),
            ("tr", self.tr.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|value| (name, value)))
    }
}

/// Failures that end the run before or outside the tool's own verdict.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The invocation or configuration is wrong; nothing was signed.
    #[error("{0}")]
    Usage(String),

    /// The gateway reported success but its response does not match
    /// what was uploaded.
    #[error("{0}")]
    Transport(String),
}

impl ClientError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Usage(_) => EXIT_USAGE,
            ClientError::Transport(_) => EXIT_TRANSPORT,
        }
    }
}

/// Upload one file and apply the gateway's response.
///
/// A signed artifact is written back over `path`; a verification
/// record is rendered to stdout. The returned code is the process exit
/// code for this file.
pub async fn submit(
    config: &Config,
    verb: &str,
    job: &JobArgs,
    path: &Path,
) -> Result<i32, ClientError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|error| ClientError::Usage(format!("failed to read {}: {error}", path.display())))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ClientError::Usage(format!("{} has no usable file name", path.display())))?
        .to_string();

    let url = build_url(&config.endpoint, verb, job)?;
    tracing::debug!(%url, %file_name, "Submitting file to the gateway");

    let part = Part::bytes(bytes)
        .file_name(file_name.clone())
        .mime_str("application/octet-stream")
        .map_err(|error| ClientError::Usage(error.to_string()))?;
    let response = reqwest::Client::new()
        .post(url)
        .header(header::AUTHORIZATION, &config.authorization)
        .multipart(Form::new().part("formFile", part))
        .send()
        .await
        .map_err(|error| ClientError::Transport(format!("request failed: {error}")))?;

    handle_response(response, path, &file_name).await
}

fn build_url(endpoint: &str, verb: &str, job: &JobArgs) -> Result<reqwest::Url, ClientError> {
    let mut url = reqwest::Url::parse(endpoint)
        .map_err(|error| ClientError::Usage(format!("invalid endpoint {endpoint:?}: {error}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("command", verb);
        if !job.options.is_empty() {
            query.append_pair("options", &job.options.join(","));
        }
        for (name, value) in job.keyed() {
            query.append_pair(name, value);
        }
    }
    Ok(url)
}

async fn handle_response(
    response: reqwest::Response,
    path: &Path,
    file_name: &str,
) -> Result<i32, ClientError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(ClientError::Usage(
            "the gateway rejected the configured credential".to_string(),
        ));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        eprint!("{body}");
        // 4xx means the gateway refused the invocation before the tool
        // ran; 5xx carries the tool's own failure output.
        return Ok(if status.is_client_error() {
            EXIT_USAGE
        } else {
            EXIT_TOOL_FAILURE
        });
    }

    if let Some(returned_name) = attachment_filename(response.headers()) {
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if content_type != "application/octet-stream" {
            return Err(ClientError::Transport(format!(
                "wrong content response - {content_type}"
            )));
        }
        if returned_name != file_name {
            return Err(ClientError::Transport(format!(
                "wrong file - {returned_name}"
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|error| ClientError::Transport(format!("download failed: {error}")))?;
        tokio::fs::write(path, &bytes).await.map_err(|error| {
            ClientError::Transport(format!("failed to write {}: {error}", path.display()))
        })?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "Wrote signed file");
        return Ok(EXIT_SUCCESS);
    }

    let record: VerifyRecord = response
        .json()
        .await
        .map_err(|error| ClientError::Transport(format!("unreadable response: {error}")))?;
    println!("{}", render::table(&record));
    Ok(render::exit_code(&record))
}

fn attachment_filename(headers: &header::HeaderMap) -> Option<String> {
    let disposition = headers.get(header::CONTENT_DISPOSITION)?.to_str().ok()?;
    if !disposition.trim_start().starts_with("attachment") {
        return None;
    }
    disposition.split(';').find_map(|part| {
        let value = part.trim().strip_prefix("filename=")?;
        Some(value.trim_matches('"').to_string())
    })
}
