// SPDX-License-Identifier: MIT

use clap::Parser;

use crate::config::{self, Config};

/// An HTTP gateway in front of a local code-signing tool.
///
/// Clients POST a file with a `sign` or `verify` command; the gateway
/// stages it in an isolated directory, runs the configured signing
/// strategy against it, and returns the signed artifact or a
/// verification report.
///
/// Logging goes to stderr and is controlled with the
/// `SIGNTOOL_GATEWAY_LOG` environment variable, which accepts
/// `tracing_subscriber` filter directives (plain levels like "info"
/// or per-target filters).
#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// Path to the configuration file; the defaults apply when no
    /// path is given.
    #[arg(long, short, env = "SIGNTOOL_GATEWAY_CONFIG", value_parser = config::load)]
    pub config: Option<Config>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run the gateway.
    Listen,
    /// Print the configuration in effect, as a TOML document that can
    /// seed a configuration file.
    Config,
}
