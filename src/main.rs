//! preforkd - pre-forking worker pool supervisor

mod cli;
mod config;
mod error;
mod logging;
mod supervisor;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use tracing::Level;

use cli::{Cli, Commands, ConfigArgs};
use supervisor::{ProcessLauncher, Supervisor, control_channel, spawn_signal_watcher};

fn main() {
    let cli = Cli::parse();

    init_logging(&cli);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Check(args) => cmd_check(args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
        Commands::Worker => supervisor::worker_main::run().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Map `-v`/`-q` to a log level and install the subscriber.
fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    logging::init(level);
}

/// Start the supervisor: bind the shared socket, wire up signal handling,
/// and run the pool until shutdown.
fn cmd_run(args: &ConfigArgs) -> Result<()> {
    let overrides = args.overrides();
    let config = config::resolve(&args.environment, &overrides)?;

    let launcher = ProcessLauncher::bind(&config)?;
    let (handle, commands) = control_channel();
    spawn_signal_watcher(handle);

    let mut supervisor = Supervisor::new(
        launcher,
        config,
        args.environment.clone(),
        overrides,
        commands,
    );
    supervisor.run()?;
    Ok(())
}

/// Resolve the effective configuration and print it.
fn cmd_check(args: &ConfigArgs) -> Result<()> {
    let config = config::resolve(&args.environment, &args.overrides())?;

    let label = |text: &'static str| {
        text.if_supports_color(Stdout, |t| t.cyan()).to_string()
    };
    println!("{}: {}", label("environment"), config.environment);
    println!("{}: {}", label("workers"), config.worker_count);
    println!("{}: {}s", label("timeout"), config.timeout_secs());
    println!("{}: {}", label("preload"), config.preload_app);
    println!("{}: {}", label("bind"), config.bind_addr);
    Ok(())
}
