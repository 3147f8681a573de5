// SPDX-License-Identifier: MIT
//
// Drives the real router over a loopback listener with a stub signing
// backend, so every wire-visible property can be checked without a
// signing tool installed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use reqwest::header;
use reqwest::multipart::{Form, Part};
use signtool_gateway::config::Config;
use signtool_gateway::error::ServiceError;
use signtool_gateway::service::router;
use signtool_gateway::signer::{
    SigningBackend, SigningOutcome, VerificationStatus, VerifyRecord,
};
use signtool_gateway::staging::StagedFile;
use signtool_gateway::validate::{CommandKind, ValidatedArgs};
use tempfile::TempDir;

const CREDENTIAL: &str = "Basic test-credential";

/// What the stub backend should hand back when invoked.
#[derive(Clone, Copy)]
enum StubBehavior {
    /// Return the staged bytes unchanged, as a signing tool that
    /// rewrote the file in place would.
    Echo,
    /// Report a valid verification.
    Verified,
    /// The tool ran and failed.
    Failed,
}

struct StubBackend {
    behavior: StubBehavior,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl SigningBackend for StubBackend {
    async fn run(
        &self,
        _command: CommandKind,
        _args: &ValidatedArgs,
        staged: &StagedFile,
    ) -> Result<SigningOutcome, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            StubBehavior::Echo => Ok(SigningOutcome::Signed {
                bytes: staged.contents().await?,
            }),
            StubBehavior::Verified => Ok(SigningOutcome::Verified(VerifyRecord {
                signer_certificate: "AB12".to_string(),
                status: VerificationStatus::Valid,
                status_message: "Signature verified.".to_string(),
                path: staged.file_name().to_string(),
            })),
            StubBehavior::Failed => Ok(SigningOutcome::ToolFailed {
                exit_code: 1,
                stdout: "SignTool Error: no dice\n".to_string(),
                stderr: "details on stderr\n".to_string(),
            }),
        }
    }
}

struct TestServer {
    url: String,
    staging_root: TempDir,
    backend: Arc<StubBackend>,
}

impl TestServer {
    async fn start(behavior: StubBehavior) -> Result<Self> {
        let staging_root = tempfile::tempdir()?;
        let config = Config {
            authorized: vec![CREDENTIAL.to_string()],
            staging_root: staging_root.path().to_owned(),
            ..Config::default()
        };
        let endpoint = config.endpoint.clone();
        let backend = Arc::new(StubBackend {
            behavior,
            calls: AtomicUsize::new(0),
        });
        let app = router(Arc::new(config), Arc::clone(&backend) as Arc<dyn SigningBackend>);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}{}", listener.local_addr()?, endpoint);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Ok(Self {
            url,
            staging_root,
            backend,
        })
    }

    fn backend_calls(&self) -> usize {
        self.backend.calls.load(Ordering::SeqCst)
    }

    fn staging_is_empty(&self) -> bool {
        std::fs::read_dir(self.staging_root.path())
            .map(|entries| entries.count() == 0)
            .unwrap_or(true)
    }
}

fn upload(file_name: &str, bytes: &[u8]) -> Form {
    Form::new().part(
        "formFile",
        Part::bytes(bytes.to_vec()).file_name(file_name.to_string()),
    )
}

#[tokio::test]
async fn rejected_credentials_cause_no_file_io_and_no_tool_run() -> Result<()> {
    let server = TestServer::start(StubBehavior::Echo).await?;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}?command=sign", server.url))
        .header(header::AUTHORIZATION, "Basic wrong")
        .multipart(upload("app.exe", b"MZ"))
        .send()
        .await?;

    assert_eq!(response.status(), 401);
    let challenge = response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .expect("401 must carry a challenge")
        .to_str()?;
    assert_eq!(challenge, "Basic realm=\"signing\"");
    assert_eq!(server.backend_calls(), 0);
    assert!(server.staging_is_empty());

    Ok(())
}

#[tokio::test]
async fn filenames_with_path_separators_never_reach_the_disk() -> Result<()> {
    let server = TestServer::start(StubBehavior::Echo).await?;
    let client = reqwest::Client::new();

    for name in ["../escape.exe", "dir/escape.exe", "dir\\escape.exe"] {
        let response = client
            .post(format!("{}?command=sign", server.url))
            .header(header::AUTHORIZATION, CREDENTIAL)
            .multipart(upload(name, b"MZ"))
            .send()
            .await?;
        assert_eq!(response.status(), 400, "{name:?} should be rejected");
    }
    assert_eq!(server.backend_calls(), 0);
    assert!(server.staging_is_empty());

    Ok(())
}

#[tokio::test]
async fn sign_round_trips_the_original_name_and_bytes() -> Result<()> {
    let server = TestServer::start(StubBehavior::Echo).await?;
    let payload = b"MZ\x90\x00original payload".to_vec();

    let response = reqwest::Client::new()
        .post(format!("{}?command=sign&options=q,a", server.url))
        .header(header::AUTHORIZATION, CREDENTIAL)
        .multipart(upload("app.exe", &payload))
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()?,
        "application/octet-stream"
    );
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()?,
        "attachment; filename=\"app.exe\""
    );
    assert_eq!(response.bytes().await?.to_vec(), payload);
    assert_eq!(server.backend_calls(), 1);
    assert!(server.staging_is_empty());

    Ok(())
}

#[tokio::test]
async fn octet_stream_uploads_are_accepted() -> Result<()> {
    let server = TestServer::start(StubBehavior::Echo).await?;

    let response = reqwest::Client::new()
        .post(format!("{}?command=sign", server.url))
        .header(header::AUTHORIZATION, CREDENTIAL)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"raw.bin\"",
        )
        .body(b"raw bytes".to_vec())
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()?,
        "attachment; filename=\"raw.bin\""
    );
    assert_eq!(response.bytes().await?.to_vec(), b"raw bytes");

    Ok(())
}

#[tokio::test]
async fn verify_returns_the_four_field_record_in_order() -> Result<()> {
    let server = TestServer::start(StubBehavior::Verified).await?;

    let response = reqwest::Client::new()
        .post(format!("{}?command=verify", server.url))
        .header(header::AUTHORIZATION, CREDENTIAL)
        .multipart(upload("a.exe", b"MZ"))
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()?
        .starts_with("application/json"));
    let body = response.text().await?;
    assert_eq!(
        body,
        "{\"SignerCertificate\":\"AB12\",\"Status\":\"Valid\",\
         \"StatusMessage\":\"Signature verified.\",\"Path\":\"a.exe\"}"
    );

    Ok(())
}

#[tokio::test]
async fn tool_failure_is_a_plain_text_500_with_captured_output() -> Result<()> {
    let server = TestServer::start(StubBehavior::Failed).await?;

    let response = reqwest::Client::new()
        .post(format!("{}?command=sign", server.url))
        .header(header::AUTHORIZATION, CREDENTIAL)
        .multipart(upload("app.exe", b"MZ"))
        .send()
        .await?;

    assert_eq!(response.status(), 500);
    let body = response.text().await?;
    assert!(body.contains("SignTool Error: no dice"));
    assert!(body.contains("details on stderr"));
    // Cleanup also runs on the failure path.
    assert!(server.staging_is_empty());

    Ok(())
}

#[tokio::test]
async fn invalid_commands_options_and_arguments_spawn_nothing() -> Result<()> {
    let server = TestServer::start(StubBehavior::Echo).await?;
    let client = reqwest::Client::new();

    let cases = [
        ("command=exec", "exec"),
        ("command=sign&options=evil", "evil"),
        ("command=sign&sha1=not-hex", "not-hex"),
        ("command=sign&tr=not-a-url", "not-a-url"),
        ("command=sign&unknown=x", "unknown"),
    ];
    for (query, offending_token) in cases {
        let response = client
            .post(format!("{}?{query}", server.url))
            .header(header::AUTHORIZATION, CREDENTIAL)
            .multipart(upload("app.exe", b"MZ"))
            .send()
            .await?;
        assert_eq!(response.status(), 400, "query {query:?}");
        let body = response.text().await?;
        assert!(
            body.contains(offending_token),
            "error for {query:?} should name {offending_token:?}, got {body:?}"
        );
    }
    assert_eq!(server.backend_calls(), 0);
    assert!(server.staging_is_empty());

    Ok(())
}

#[tokio::test]
async fn bodies_with_other_content_types_are_rejected() -> Result<()> {
    let server = TestServer::start(StubBehavior::Echo).await?;

    let response = reqwest::Client::new()
        .post(format!("{}?command=sign", server.url))
        .header(header::AUTHORIZATION, CREDENTIAL)
        .header(header::CONTENT_TYPE, "text/plain")
        .body("hello")
        .send()
        .await?;

    assert_eq!(response.status(), 400);
    assert_eq!(server.backend_calls(), 0);

    Ok(())
}

#[tokio::test]
async fn multiple_files_in_one_form_are_ambiguous() -> Result<()> {
    let server = TestServer::start(StubBehavior::Echo).await?;

    let form = Form::new()
        .part(
            "formFile",
            Part::bytes(b"first".to_vec()).file_name("one.exe"),
        )
        .part(
            "formFile",
            Part::bytes(b"second".to_vec()).file_name("two.exe"),
        );
    let response = reqwest::Client::new()
        .post(format!("{}?command=sign", server.url))
        .header(header::AUTHORIZATION, CREDENTIAL)
        .multipart(form)
        .send()
        .await?;

    assert_eq!(response.status(), 400);
    assert_eq!(server.backend_calls(), 0);
    assert!(server.staging_is_empty());

    Ok(())
}
