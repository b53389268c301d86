//! Command-line interface definitions using clap.

use std::net::SocketAddr;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use crate::config::{ENV_VAR, Overrides};

/// Pre-forking worker pool supervisor.
#[derive(Parser, Debug)]
#[command(name = "preforkd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisor with its worker pool.
    Run(ConfigArgs),

    /// Resolve the effective configuration and print it without starting.
    Check(ConfigArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),

    /// Internal worker mode, launched by the supervisor.
    #[command(hide = true)]
    Worker,
}

/// Configuration knobs shared by `run` and `check`.
///
/// Every value resolves from the deployment environment first; flags and
/// their env vars override individual fields.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Deployment environment (e.g. production, staging, development).
    #[arg(long = "env", env = ENV_VAR, default_value = "production")]
    pub environment: String,

    /// Override the number of workers.
    #[arg(long, env = "PREFORKD_WORKERS", allow_negative_numbers = true)]
    pub workers: Option<i64>,

    /// Override the request timeout in seconds.
    #[arg(long, env = "PREFORKD_TIMEOUT", allow_negative_numbers = true)]
    pub timeout: Option<i64>,

    /// Initialize the application once in the supervisor and hand the warm
    /// image to every worker.
    #[arg(long, overrides_with = "no_preload")]
    pub preload: bool,

    /// Make every worker initialize the application for itself.
    #[arg(long, overrides_with = "preload")]
    pub no_preload: bool,

    /// Address for the shared listening socket.
    #[arg(long, env = "PREFORKD_BIND")]
    pub bind: Option<SocketAddr>,
}

impl ConfigArgs {
    /// Collapse the flags into config overrides.
    pub fn overrides(&self) -> Overrides {
        Overrides {
            worker_count: self.workers,
            timeout_secs: self.timeout,
            preload_app: if self.preload {
                Some(true)
            } else if self.no_preload {
                Some(false)
            } else {
                None
            },
            bind_addr: self.bind,
        }
    }
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "preforkd",
            &mut std::io::stdout(),
        );
    }
}
