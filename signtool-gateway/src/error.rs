// SPDX-License-Identifier: MIT

//! The error taxonomy for the request pipeline.
//!
//! Authentication and validation failures are caller errors; they are
//! detected before any file is staged and before any subprocess is
//! spawned. A signing tool that ran and reported failure is *not* an
//! error: it travels through [`crate::signer::SigningOutcome`] so
//! callers can tell "the tool said no" apart from "the tool could not
//! run".

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

/// Errors produced while handling one signing request.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The authorization header did not match any accepted credential.
    ///
    /// The response carries the configured challenge; it never reveals
    /// which credential was presented or why it failed.
    #[error("not authorized")]
    Unauthorized {
        /// The `WWW-Authenticate` value, e.g. `Basic realm="signing"`.
        challenge: String,
    },

    /// The uploaded file name contained a path separator or was empty.
    #[error("invalid filename {0:?}")]
    InvalidFilename(String),

    /// The request body was not a form or octet-stream upload carrying
    /// exactly one file.
    #[error("malformed upload: {0}")]
    MalformedUpload(String),

    /// The `command` query value was not `sign` or `verify`.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// An option flag was outside the allowlist.
    #[error("invalid option {0:?}")]
    InvalidOption(String),

    /// A keyed argument failed validation.
    #[error("invalid argument {name}={value:?}: {reason}")]
    InvalidArgument {
        name: String,
        value: String,
        reason: String,
    },

    /// The requested thumbprint matched zero or several certificates
    /// in the store; signing with an ambiguous certificate reference
    /// is refused.
    #[error("thumbprint {thumbprint} matched {matches} certificates; expected exactly one")]
    AmbiguousCertificate { thumbprint: String, matches: usize },

    /// The signing tool could not be started, timed out, or produced
    /// output the gateway could not interpret.
    #[error("failed to run the signing tool: {0}")]
    ToolLaunch(String),

    /// Filesystem failure while staging or reading back the upload.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    fn status(&self) -> StatusCode {
        match self {
            ServiceError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidFilename(_)
            | ServiceError::MalformedUpload(_)
            | ServiceError::UnknownCommand(_)
            | ServiceError::InvalidOption(_)
            | ServiceError::InvalidArgument { .. }
            | ServiceError::AmbiguousCertificate { .. } => StatusCode::BAD_REQUEST,
            ServiceError::ToolLaunch(_) | ServiceError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            ServiceError::Unauthorized { challenge } => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, challenge)],
            )
                .into_response(),
            error => (error.status(), error.to_string()).into_response(),
        }
    }
}
