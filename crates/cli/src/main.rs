// queuectl CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Logs go to stderr so stdout stays parseable.

mod commands;
mod output;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use queuectl_durable::persistence::{JobStore, SqliteJobStore};
use queuectl_durable::{JobState, QueueSettings};

#[derive(Parser)]
#[command(name = "queuectl")]
#[command(about = "queuectl - Persistent shell job queue with retries and a dead letter queue")]
#[command(version)]
pub struct Cli {
    /// SQLite database file
    #[arg(long, env = "QUEUECTL_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"], global = true)]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add a job to the queue
    Enqueue {
        /// Job as JSON, e.g. '{"id":"job1","command":"echo hi","max_retries":3}'
        job_json: String,
    },

    /// Manage workers
    Worker {
        #[command(subcommand)]
        command: commands::worker::WorkerCommand,
    },

    /// Show job counts and registered workers
    Status,

    /// List jobs
    List {
        /// Only jobs in this state (pending, processing, completed, dead)
        #[arg(long)]
        state: Option<JobState>,
    },

    /// Dead letter queue operations
    Dlq {
        #[command(subcommand)]
        command: commands::dlq::DlqCommand,
    },

    /// Read or write persisted configuration
    Config {
        #[command(subcommand)]
        command: commands::config::ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init_telemetry(telemetry::TelemetryConfig::from_env());

    let mut settings = QueueSettings::from_env();
    if let Some(db) = cli.db {
        settings.database.path = db;
    }
    let output_format = output::OutputFormat::from_str(&cli.output);

    let store = SqliteJobStore::open(&settings.database)
        .await
        .with_context(|| {
            format!(
                "Failed to open job store: {}",
                settings.database.path.display()
            )
        })?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    match cli.command {
        Commands::Enqueue { job_json } => {
            commands::jobs::enqueue(store.as_ref(), output_format, cli.quiet, &job_json).await
        }
        Commands::Worker { command } => {
            commands::worker::run(command, store, &settings, output_format, cli.quiet).await
        }
        Commands::Status => commands::jobs::status(store.as_ref(), &settings, output_format).await,
        Commands::List { state } => commands::jobs::list(store.as_ref(), output_format, state).await,
        Commands::Dlq { command } => {
            commands::dlq::run(command, store.as_ref(), output_format, cli.quiet).await
        }
        Commands::Config { command } => {
            commands::config::run(command, store.as_ref(), output_format).await
        }
    }
}
