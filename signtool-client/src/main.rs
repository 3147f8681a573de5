// SPDX-License-Identifier: MIT

//! A signtool-style command line client for signtool-gateway.

use clap::Parser;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer as _;

mod config;
mod render;
mod request;

use config::Config;
use request::JobArgs;

/// The tool reported success for every file.
pub const EXIT_SUCCESS: i32 = 0;
/// The tool ran and reported a failure, or a verification did not
/// come back valid.
pub const EXIT_TOOL_FAILURE: i32 = 1;
/// The invocation or configuration is wrong; nothing was submitted
/// (or the gateway refused the credential).
pub const EXIT_USAGE: i32 = 2;
/// The gateway's response did not match the uploaded file.
pub const EXIT_TRANSPORT: i32 = 3;

#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, short, env = "SIGNTOOL_CLIENT_CONFIG", value_parser = config::load)]
    config: Option<Config>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Sign one or more files in place via the gateway.
    Sign(JobArgs),
    /// Verify the signatures on one or more files.
    Verify(JobArgs),
    /// Print the current configuration.
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var("SIGNTOOL_CLIENT_LOG")
        .from_env()?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(log_filter);
    tracing_subscriber::registry().with(stderr_layer).init();

    std::process::exit(run(opts).await);
}

async fn run(opts: Cli) -> i32 {
    let config = opts.config.unwrap_or_default();
    let (verb, job) = match &opts.command {
        Command::Config => {
            println!("{config}");
            return EXIT_SUCCESS;
        }
        Command::Sign(job) => ("sign", job),
        Command::Verify(job) => ("verify", job),
    };

    for path in &job.files {
        match request::submit(&config, verb, job, path).await {
            Ok(EXIT_SUCCESS) => {}
            Ok(code) => return code,
            Err(error) => {
                eprintln!("{error}");
                return error.exit_code();
            }
        }
    }
    EXIT_SUCCESS
}
