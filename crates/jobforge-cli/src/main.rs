//! Operator entry point: loads [`QueueConfig`] from a TOML file (falling
//! back to defaults), builds the configured driver, and dispatches to a
//! subcommand. Exit codes follow the taxonomy in `jobforge_core::error`:
//! 0 success, 1 configuration error, 2 storage error, 3 unknown task.

mod commands;

use clap::{Parser, Subcommand};
use jobforge_core::{Categorizable, JobforgeError, QueueConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "jobforge", about = "Operator CLI for the jobforge job queue", version)]
struct Cli {
    /// Path to a TOML config file; omit to run with defaults (in-memory driver).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single reserve-execute cycle.
    Run {
        #[arg(long, value_delimiter = ',')]
        queue: Vec<String>,
    },
    /// Reserve and execute up to `size` jobs, bounded by a wall-clock ceiling.
    Batch {
        #[arg(long, default_value_t = 10)]
        size: i64,
        #[arg(long, value_delimiter = ',')]
        queue: Vec<String>,
        #[arg(long, default_value_t = 55)]
        max_wall_seconds: u64,
    },
    /// Dead-letter admin surface.
    #[command(subcommand)]
    Failed(FailedCommand),
    /// Print aggregate queue statistics.
    Stats {
        #[arg(long)]
        queue: Option<String>,
    },
    /// Apply the storage schema for the configured driver.
    Migrate,
}

#[derive(Subcommand)]
enum FailedCommand {
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    Retry {
        id: i64,
    },
    RetryAll {
        #[arg(long)]
        queue: Option<String>,
    },
    Purge {
        #[arg(long)]
        queue: Option<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<QueueConfig, JobforgeError> {
    match path {
        None => Ok(QueueConfig::default()),
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| JobforgeError::Config(format!("reading {}: {e}", path.display())))?;
            toml::from_str(&text).map_err(|e| JobforgeError::Config(format!("parsing {}: {e}", path.display())))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    let result = commands::dispatch(cli.command, config).await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
