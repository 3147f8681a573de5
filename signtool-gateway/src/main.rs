// SPDX-License-Identifier: MIT

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer as _;

use signtool_gateway::cli;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("SIGNTOOL_GATEWAY_LOG")
        .from_env()?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(log_filter);
    tracing_subscriber::registry().with(stderr_layer).init();

    let halt_token = CancellationToken::new();
    tokio::spawn(shutdown(halt_token.clone()));

    let opts = cli::Cli::parse();
    match opts.command {
        cli::Command::Listen => {
            signtool_gateway::listen(opts.config.unwrap_or_default(), halt_token)?.await?
        }
        cli::Command::Config => {
            println!("{}", opts.config.unwrap_or_default());
            Ok(())
        }
    }
}

/// Wait for SIGTERM or SIGINT, then begin a graceful shutdown: the
/// listener stops accepting uploads and in-flight signing requests
/// drain before the process exits.
async fn shutdown(halt_token: CancellationToken) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("SIGTERM received, draining in-flight requests"),
        _ = sigint.recv() => tracing::info!("SIGINT received, draining in-flight requests"),
    }
    halt_token.cancel();
    Ok(())
}
