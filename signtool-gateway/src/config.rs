// SPDX-License-Identifier: MIT

//! The configuration format for `signtool-gateway`.
//!
//! Configuration is provided via a command-line argument or
//! environment variable (`SIGNTOOL_GATEWAY_CONFIG`). The configuration
//! should be in TOML format.
//!
//! There is no configuration merging: a configuration file must
//! contain settings for _all_ required fields. The configuration is
//! read once at startup and never mutated afterwards; request
//! handlers see it behind an `Arc`.
//!
//! To validate your configuration, refer to the
//! `signtool-gateway config` command.

use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// The configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The socket address the HTTP listener binds.
    pub listen: SocketAddr,

    /// The URL path the signing endpoint is served at.
    pub endpoint: String,

    /// The authentication scheme named in the `WWW-Authenticate`
    /// challenge, e.g. `Basic`.
    pub scheme: String,

    /// The realm named in the `WWW-Authenticate` challenge.
    pub realm: String,

    /// Full authorization header values accepted by the gateway,
    /// scheme included, compared byte-for-byte.
    ///
    /// Listing more than one value lets credentials rotate without
    /// downtime: add the new value, move the clients over, drop the
    /// old one.
    pub authorized: Vec<String>,

    /// The directory under which per-request staging directories are
    /// created. Created on demand if missing.
    pub staging_root: PathBuf,

    /// The largest upload accepted, in bytes.
    pub max_upload_bytes: usize,

    /// The total length of time (in seconds) one request may take,
    /// including the signing tool run. Requests over the limit fail;
    /// the staging directory is still cleaned up.
    pub request_timeout_secs: NonZeroU64,

    /// How long (in seconds) one signing tool invocation may run.
    /// Must be shorter than `request_timeout_secs`, so a stuck tool
    /// surfaces as a tool timeout rather than a generic request
    /// timeout.
    pub tool_timeout_secs: NonZeroU64,

    /// Which signing strategy handles requests.
    pub signer: SignerConfig,
}

/// The signing strategy and its tool location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum SignerConfig {
    /// Run the signing utility directly against the staged file.
    Signtool {
        /// The signing utility, an absolute path or a `PATH` lookup.
        program: PathBuf,
    },
    /// Resolve a certificate by thumbprint from the current user's
    /// personal store and sign through the automation host.
    CertificateStore {
        /// The automation host executable, e.g. `pwsh`.
        host_program: PathBuf,
    },
}

impl Config {
    /// Check the configuration for values that cannot work.
    ///
    /// This runs once before the listener starts; an invalid
    /// configuration refuses to serve rather than failing requests
    /// one at a time.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.authorized.is_empty() {
            anyhow::bail!("at least one authorized credential is required");
        }
        if self.authorized.iter().any(|credential| credential.is_empty()) {
            anyhow::bail!("empty strings are not acceptable credentials");
        }
        if !self.endpoint.starts_with('/') {
            anyhow::bail!("the endpoint path must start with '/'");
        }
        if self.max_upload_bytes == 0 {
            anyhow::bail!("max_upload_bytes must be greater than zero");
        }
        if self.tool_timeout_secs >= self.request_timeout_secs {
            anyhow::bail!("tool_timeout_secs must be shorter than request_timeout_secs");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8743".parse().expect("default address is valid"),
            endpoint: "/signtool".to_string(),
            scheme: "Basic".to_string(),
            realm: "signing".to_string(),
            authorized: vec!["Basic dXNlcjpwYXNzd29yZA==".to_string()],
            staging_root: std::env::temp_dir().join("signtool-gateway"),
            max_upload_bytes: 64 * 1024 * 1024,
            request_timeout_secs: NonZeroU64::new(120).expect("Don't set the default to 0"),
            tool_timeout_secs: NonZeroU64::new(60).expect("Don't set the default to 0"),
            signer: SignerConfig::Signtool {
                program: PathBuf::from("signtool"),
            },
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

pub fn load(path: &str) -> anyhow::Result<Config> {
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(%path, "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", Config::default());
        })
        .context("configuration file is invalid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let rendered = Config::default().to_string();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.endpoint, "/signtool");
    }

    #[test]
    fn empty_credential_set_is_rejected() {
        let config = Config {
            authorized: vec![],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn tool_timeout_must_be_shorter_than_the_request_timeout() {
        let config = Config {
            tool_timeout_secs: NonZeroU64::new(120).unwrap(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_endpoint_is_rejected() {
        let config = Config {
            endpoint: "signtool".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
