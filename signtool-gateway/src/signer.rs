// SPDX-License-Identifier: MIT

//! Signing tool invocation strategies.
//!
//! Two interchangeable backends satisfy [`SigningBackend`], selected
//! by the deployment configuration: [`SigntoolBackend`] runs the
//! signing utility directly against the staged file, while
//! [`StoreBackend`] resolves a certificate from the local store and
//! signs through an external automation host. Both record every
//! invocation with its full argument line, capture the tool's output
//! streams, and never retry: a failed signing attempt is surfaced to
//! the caller, who decides whether to resubmit the original file.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::SignerConfig;
use crate::error::ServiceError;
use crate::staging::StagedFile;
use crate::validate::{CommandKind, ValidatedArgs};

/// Verification states reported by the signing facility.
///
/// This is the complete status set of the automation host's signature
/// object. Anything the gateway does not recognize is carried through
/// as [`VerificationStatus::Unrecognized`] and never counts as
/// success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationStatus {
    Valid,
    UnknownError,
    NotSigned,
    HashMismatch,
    NotTrusted,
    NotSupportedFileFormat,
    Incompatible,
    Unrecognized(String),
}

impl VerificationStatus {
    /// Whether this status is the one and only success state.
    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationStatus::Valid)
    }
}

impl From<&str> for VerificationStatus {
    fn from(value: &str) -> Self {
        match value {
            "Valid" => VerificationStatus::Valid,
            "UnknownError" => VerificationStatus::UnknownError,
            "NotSigned" => VerificationStatus::NotSigned,
            "HashMismatch" => VerificationStatus::HashMismatch,
            "NotTrusted" => VerificationStatus::NotTrusted,
            "NotSupportedFileFormat" => VerificationStatus::NotSupportedFileFormat,
            "Incompatible" => VerificationStatus::Incompatible,
            other => VerificationStatus::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerificationStatus::Valid => "Valid",
            VerificationStatus::UnknownError => "UnknownError",
            VerificationStatus::NotSigned => "NotSigned",
            VerificationStatus::HashMismatch => "HashMismatch",
            VerificationStatus::NotTrusted => "NotTrusted",
            VerificationStatus::NotSupportedFileFormat => "NotSupportedFileFormat",
            VerificationStatus::Incompatible => "Incompatible",
            VerificationStatus::Unrecognized(name) => name,
        };
        f.write_str(name)
    }
}

impl Serialize for VerificationStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VerificationStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(VerificationStatus::from(name.as_str()))
    }
}

/// The structured result of a `verify` command.
///
/// Field order is part of the wire contract. `Path` always reports
/// the client-visible file name; the server's staging path must never
/// leak into this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VerifyRecord {
    pub signer_certificate: String,
    pub status: VerificationStatus,
    pub status_message: String,
    pub path: String,
}

/// Everything one signing run can legitimately produce.
///
/// `ToolFailed` is a normal, reportable outcome: the tool ran and said
/// no. A tool that could not run at all is a [`ServiceError`] instead.
#[derive(Debug)]
pub enum SigningOutcome {
    /// The tool signed the staged file; these are the signed bytes.
    Signed { bytes: Vec<u8> },
    /// The tool examined the staged file's signature.
    Verified(VerifyRecord),
    /// The tool ran and exited unsuccessfully.
    ToolFailed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
}

/// A signing or verification strategy.
#[async_trait::async_trait]
pub trait SigningBackend: Send + Sync {
    /// Run `command` against the staged file with validated arguments.
    async fn run(
        &self,
        command: CommandKind,
        args: &ValidatedArgs,
        staged: &StagedFile,
    ) -> Result<SigningOutcome, ServiceError>;
}

/// Build the backend selected by the deployment configuration.
pub fn from_config(config: &SignerConfig, timeout: Duration) -> Arc<dyn SigningBackend> {
    match config {
        SignerConfig::Signtool { program } => {
            Arc::new(SigntoolBackend::new(program.clone(), timeout))
        }
        SignerConfig::CertificateStore { host_program } => {
            let store = Arc::new(HostCertificateStore::new(host_program.clone(), timeout));
            Arc::new(StoreBackend::new(store, host_program.clone(), timeout))
        }
    }
}

/// Replace any occurrence of the staging path in tool-produced text
/// with the client-visible file name.
fn scrub_staging_path(text: &str, staged: &StagedFile) -> String {
    text.replace(&staged.path().display().to_string(), staged.file_name())
}

// ---------------------------------------------------------------------------
// Direct tool strategy
// ---------------------------------------------------------------------------

/// Runs the signing utility directly: the verb, each flag prefixed
/// `/`, each keyed argument as `/name value`, and the staged file
/// path last.
#[derive(Debug, Clone)]
pub struct SigntoolBackend {
    program: PathBuf,
    timeout: Duration,
}

impl SigntoolBackend {
    pub fn new(program: PathBuf, timeout: Duration) -> Self {
        Self { program, timeout }
    }

    /// The token list handed to the process, one argument per token.
    /// No shell is involved; quoting exists only in the audit line.
    fn argument_line(
        command: CommandKind,
        args: &ValidatedArgs,
        staged: &StagedFile,
    ) -> Vec<String> {
        let mut line = vec![command.verb().to_string()];
        for option in args.options() {
            line.push(format!("/{option}"));
        }
        for (name, value) in args.keyed() {
            line.push(format!("/{name}"));
            line.push(value.to_string());
        }
        line.push(staged.path().display().to_string());
        line
    }

    /// The audit form of the argument line, with the trailing path
    /// quoted the way the tool would receive it from a shell.
    fn audit_line(line: &[String]) -> String {
        let mut audit = line.to_vec();
        if let Some(path) = audit.last_mut() {
            *path = format!("\"{path}\"");
        }
        audit.join(" ")
    }
}

#[async_trait::async_trait]
impl SigningBackend for SigntoolBackend {
    async fn run(
        &self,
        command: CommandKind,
        args: &ValidatedArgs,
        staged: &StagedFile,
    ) -> Result<SigningOutcome, ServiceError> {
        let line = Self::argument_line(command, args, staged);
        tracing::info!(
            program = %self.program.display(),
            arguments = %Self::audit_line(&line),
            "Invoking signing tool"
        );

        let mut tool = tokio::process::Command::new(&self.program);
        tool.args(&line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, tool.output())
            .await
            .map_err(|_| {
                ServiceError::ToolLaunch(format!(
                    "{} did not finish within {} seconds",
                    self.program.display(),
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|error| {
                tracing::error!(?error, program = %self.program.display(), "Unable to spawn the signing tool");
                ServiceError::ToolLaunch(error.to_string())
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !stdout.is_empty() {
            tracing::info!(%stdout, "Signing tool standard output");
        }
        if !stderr.is_empty() {
            tracing::info!(%stderr, "Signing tool standard error");
        }

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            tracing::warn!(exit_code, "Signing tool reported failure");
            // The tool echoes the staged path in its diagnostics; the
            // caller only ever sees the name it uploaded.
            return Ok(SigningOutcome::ToolFailed {
                exit_code,
                stdout: scrub_staging_path(&stdout, staged),
                stderr: scrub_staging_path(&stderr, staged),
            });
        }

        match command {
            CommandKind::Sign => {
                // The tool signs in place; read the rewritten file back.
                let bytes = staged.contents().await?;
                Ok(SigningOutcome::Signed { bytes })
            }
            CommandKind::Verify => Ok(SigningOutcome::Verified(VerifyRecord {
                signer_certificate: args.get("sha1").unwrap_or_default().to_string(),
                status: VerificationStatus::Valid,
                status_message: scrub_staging_path(stdout.trim(), staged),
                path: staged.file_name().to_string(),
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// Certificate-store strategy
// ---------------------------------------------------------------------------

/// A certificate resolved from the local credential store.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoreCertificate {
    pub thumbprint: String,
    #[serde(default)]
    pub subject: String,
}

/// The operating system's certificate store, consumed as an opaque
/// capability: the gateway only looks up signing certificates by
/// thumbprint in the current user's personal scope.
#[async_trait::async_trait]
pub trait CertificateStore: Send + Sync {
    async fn find_by_thumbprint(
        &self,
        thumbprint: &str,
    ) -> Result<Vec<StoreCertificate>, ServiceError>;
}

/// Certificate lookup through the automation host's store drive.
#[derive(Debug, Clone)]
pub struct HostCertificateStore {
    program: PathBuf,
    timeout: Duration,
}

impl HostCertificateStore {
    pub fn new(program: PathBuf, timeout: Duration) -> Self {
        Self { program, timeout }
    }
}

#[async_trait::async_trait]
impl CertificateStore for HostCertificateStore {
    async fn find_by_thumbprint(
        &self,
        thumbprint: &str,
    ) -> Result<Vec<StoreCertificate>, ServiceError> {
        let script = format!(
            "Get-ChildItem -LiteralPath 'Cert:\\CurrentUser\\My' \
             | Where-Object {{ $_.Thumbprint -eq {thumbprint} }} \
             | ForEach-Object {{ [pscustomobject]@{{ Thumbprint = $_.Thumbprint; Subject = $_.Subject }} }} \
             | ConvertTo-Json -AsArray",
            thumbprint = host_quote(thumbprint),
        );
        let output = run_host(&self.program, &script, self.timeout).await?;
        if !output.status.success() {
            return Err(ServiceError::ToolLaunch(format!(
                "certificate store lookup failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|error| {
            ServiceError::ToolLaunch(format!("unreadable certificate store result: {error}"))
        })
    }
}

/// The automation host's signature object, projected to plain fields
/// by the invocation script so enum statuses arrive as their symbolic
/// names.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostSignature {
    #[serde(default)]
    signer_certificate: Option<String>,
    status: String,
    #[serde(default)]
    status_message: Option<String>,
}

/// Signs and verifies through the external automation host with a
/// certificate resolved from the local store.
pub struct StoreBackend {
    store: Arc<dyn CertificateStore>,
    host_program: PathBuf,
    timeout: Duration,
}

impl StoreBackend {
    pub fn new(
        store: Arc<dyn CertificateStore>,
        host_program: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            host_program,
            timeout,
        }
    }

    async fn invoke_host(&self, script: &str) -> Result<std::process::Output, ServiceError> {
        tracing::info!(
            program = %self.host_program.display(),
            arguments = %script,
            "Invoking automation host"
        );
        run_host(&self.host_program, script, self.timeout).await
    }

    fn sign_script(&self, thumbprint: &str, args: &ValidatedArgs, staged: &StagedFile) -> String {
        let mut invocation = format!(
            "Set-AuthenticodeSignature -LiteralPath {path} \
             -Certificate (Get-Item -LiteralPath {cert})",
            path = host_quote(&staged.path().display().to_string()),
            cert = host_quote(&format!("Cert:\\CurrentUser\\My\\{thumbprint}")),
        );
        if let Some(algorithm) = args.get("fd") {
            invocation.push_str(&format!(" -HashAlgorithm {}", host_quote(algorithm)));
        }
        if let Some(server) = args.get("tr").or_else(|| args.get("t")) {
            invocation.push_str(&format!(" -TimestampServer {}", host_quote(server)));
        }
        format!("{invocation} | {PROJECT_SIGNATURE}")
    }

    fn verify_script(&self, staged: &StagedFile) -> String {
        format!(
            "Get-AuthenticodeSignature -LiteralPath {path} | {PROJECT_SIGNATURE}",
            path = host_quote(&staged.path().display().to_string()),
        )
    }
}

/// Pipeline suffix rendering a signature object as JSON with enum
/// properties as symbolic names.
const PROJECT_SIGNATURE: &str = "ForEach-Object { [pscustomobject]@{ \
     SignerCertificate = $_.SignerCertificate.Thumbprint; \
     Status = $_.Status.ToString(); \
     StatusMessage = $_.StatusMessage; \
     Path = $_.Path } } | ConvertTo-Json";

#[async_trait::async_trait]
impl SigningBackend for StoreBackend {
    async fn run(
        &self,
        command: CommandKind,
        args: &ValidatedArgs,
        staged: &StagedFile,
    ) -> Result<SigningOutcome, ServiceError> {
        match command {
            CommandKind::Sign => {
                let thumbprint =
                    args.get("sha1")
                        .ok_or_else(|| ServiceError::InvalidArgument {
                            name: "sha1".to_string(),
                            value: String::new(),
                            reason: "the certificate-store signer requires a thumbprint"
                                .to_string(),
                        })?;

                let matches = self.store.find_by_thumbprint(thumbprint).await?;
                if matches.len() != 1 {
                    tracing::warn!(
                        thumbprint,
                        matches = matches.len(),
                        "Refusing to sign with an ambiguous certificate reference"
                    );
                    return Err(ServiceError::AmbiguousCertificate {
                        thumbprint: thumbprint.to_string(),
                        matches: matches.len(),
                    });
                }

                let output = self
                    .invoke_host(&self.sign_script(thumbprint, args, staged))
                    .await?;
                if !output.status.success() {
                    return Ok(tool_failed(&output, staged));
                }

                let signature = parse_host_signature(&output.stdout)?;
                let status = VerificationStatus::from(signature.status.as_str());
                let message =
                    scrub_staging_path(&signature.status_message.unwrap_or_default(), staged);
                if status.is_valid() {
                    let bytes = staged.contents().await?;
                    Ok(SigningOutcome::Signed { bytes })
                } else {
                    // The host exits zero even when signing fails; the
                    // non-valid status is the failure signal.
                    Ok(SigningOutcome::ToolFailed {
                        exit_code: 1,
                        stdout: format!("{status}: {message}"),
                        stderr: String::new(),
                    })
                }
            }
            CommandKind::Verify => {
                let output = self.invoke_host(&self.verify_script(staged)).await?;
                if !output.status.success() {
                    return Ok(tool_failed(&output, staged));
                }

                let signature = parse_host_signature(&output.stdout)?;
                Ok(SigningOutcome::Verified(VerifyRecord {
                    signer_certificate: signature.signer_certificate.unwrap_or_default(),
                    status: VerificationStatus::from(signature.status.as_str()),
                    status_message: scrub_staging_path(
                        &signature.status_message.unwrap_or_default(),
                        staged,
                    ),
                    path: staged.file_name().to_string(),
                }))
            }
        }
    }
}

fn tool_failed(output: &std::process::Output, staged: &StagedFile) -> SigningOutcome {
    SigningOutcome::ToolFailed {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: scrub_staging_path(&String::from_utf8_lossy(&output.stdout), staged),
        stderr: scrub_staging_path(&String::from_utf8_lossy(&output.stderr), staged),
    }
}

fn parse_host_signature(stdout: &[u8]) -> Result<HostSignature, ServiceError> {
    serde_json::from_slice(stdout).map_err(|error| {
        ServiceError::ToolLaunch(format!("unreadable automation host result: {error}"))
    })
}

/// Single-quote a value for the automation host, doubling embedded
/// quotes. Validated arguments can't contain quotes, but file names
/// can.
fn host_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

async fn run_host(
    program: &PathBuf,
    script: &str,
    timeout: Duration,
) -> Result<std::process::Output, ServiceError> {
    let mut host = tokio::process::Command::new(program);
    host.args(["-NoProfile", "-NonInteractive", "-Command", script])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    tokio::time::timeout(timeout, host.output())
        .await
        .map_err(|_| {
            ServiceError::ToolLaunch(format!(
                "{} did not finish within {} seconds",
                program.display(),
                timeout.as_secs()
            ))
        })?
        .map_err(|error| {
            tracing::error!(?error, program = %program.display(), "Unable to spawn the automation host");
            ServiceError::ToolLaunch(error.to_string())
        })
}
