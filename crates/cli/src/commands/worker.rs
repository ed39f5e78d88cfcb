// Worker management commands

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;
use queuectl_durable::config::{keys, load_backoff_base};
use queuectl_durable::persistence::JobStore;
use queuectl_durable::worker::{request_stop, Supervisor, SupervisorConfig, WorkerConfig};
use queuectl_durable::QueueSettings;
use tracing::warn;

use crate::output::{print_field, OutputFormat};

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// Start workers in the foreground until stopped
    Start {
        /// Number of workers to run
        #[arg(long, default_value = "1")]
        count: usize,

        /// Backoff base (persisted; defaults to the stored value or 2)
        #[arg(long)]
        backoff_base: Option<u32>,

        /// Per-job timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Ask running workers to stop after their current job
    Stop,
}

pub async fn run(
    command: WorkerCommand,
    store: Arc<dyn JobStore>,
    settings: &QueueSettings,
    output: OutputFormat,
    quiet: bool,
) -> Result<()> {
    match command {
        WorkerCommand::Start {
            count,
            backoff_base,
            timeout,
        } => start(store, settings, output, quiet, count, backoff_base, timeout).await,
        WorkerCommand::Stop => stop(store.as_ref(), output, quiet).await,
    }
}

async fn start(
    store: Arc<dyn JobStore>,
    settings: &QueueSettings,
    output: OutputFormat,
    quiet: bool,
    count: usize,
    backoff_base: Option<u32>,
    timeout: Option<u64>,
) -> Result<()> {
    let backoff_base = match backoff_base {
        Some(base) => {
            store
                .set_config(keys::BACKOFF_BASE, &base.to_string())
                .await
                .context("Failed to persist backoff base")?;
            base
        }
        None => load_backoff_base(store.as_ref()).await?,
    };

    let worker = WorkerConfig::default()
        .with_backoff_base(backoff_base)
        .with_job_timeout(timeout.map(Duration::from_secs));
    let config = SupervisorConfig::new(count)
        .with_worker(worker)
        .with_registry_path(&settings.workers_file);

    let supervisor = Supervisor::start(store, config)
        .await
        .context("Failed to start workers")?;

    if output.is_text() && !quiet {
        println!("Started {} worker(s)", count);
        print_field("Workers", &supervisor.worker_ids().join(", "));
        print_field("Backoff base", &backoff_base.to_string());
        if let Some(secs) = timeout {
            print_field("Timeout", &format!("{}s", secs));
        }
    }

    let report = supervisor.run_until_stopped().await;

    if !report.timed_out.is_empty() {
        warn!(
            workers = ?report.timed_out,
            "some workers were still running a job at exit"
        );
    }

    if output.is_text() {
        if !quiet {
            println!(
                "Shutdown complete: {} stopped, {} failed, {} timed out",
                report.stopped.len(),
                report.failed.len(),
                report.timed_out.len()
            );
            for failure in &report.failed {
                print_field(&failure.worker_id, &failure.error);
            }
        }
    } else {
        output.print_value(&report)?;
    }

    Ok(())
}

async fn stop(store: &dyn JobStore, output: OutputFormat, quiet: bool) -> Result<()> {
    request_stop(store)
        .await
        .context("Failed to record stop request")?;

    if output.is_text() {
        if !quiet {
            println!("Stop signal sent to workers. They exit after their current job.");
        }
    } else {
        output.print_value(&serde_json::json!({ "stop_requested": true }))?;
    }

    Ok(())
}
