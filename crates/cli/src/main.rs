//! viewsync CLI
//!
//! Runs one view: consumes a Kafka partition and materializes it into Redis.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::{CheckCommand, RunCommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use viewsync_config::ObservabilityConfig;

#[derive(Parser)]
#[command(
    name = "viewsync",
    version,
    about = "Materialize a Kafka partition into a Redis view",
    long_about = "Consumes one partition of a topic, applies every message to a Redis view\n\
                  and periodically checkpoints how far the view is complete.\n\n\
                  A restarted process resumes right after the last checkpoint."
)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "VIEWSYNC_CONFIG",
        value_name = "FILE",
        help = "Path to configuration file"
    )]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,

    /// JSON logs
    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the view until interrupted
    #[command(name = "run", about = "Consume and materialize until interrupted")]
    Run(RunCommand),

    /// Validate configuration
    #[command(name = "check", about = "Validate configuration and optionally probe Redis")]
    Check(CheckCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(command) => {
            let config = command.overrides.resolve(cli.config.as_deref(), cli.verbose, cli.json_logs)?;
            init_tracing(&config.observability);
            command.execute(config).await
        }
        Commands::Check(command) => {
            let config = command.overrides.resolve(cli.config.as_deref(), cli.verbose, cli.json_logs)?;
            init_tracing(&config.observability);
            command.execute(config).await
        }
    }
}

/// Initialize tracing/logging
///
/// `RUST_LOG` wins over the configured level.
fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&observability.log_level));

    let json = observability.json_logs;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_target(false)))
        .init();
}
