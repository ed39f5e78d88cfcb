// Job submission and inspection commands

use anyhow::{Context, Result};
use queuectl_durable::config::load_default_max_retries;
use queuectl_durable::persistence::{JobStore, StoreError};
use queuectl_durable::worker::WorkerRegistry;
use queuectl_durable::{JobState, NewJob, QueueSettings};
use serde::Serialize;
use tracing::warn;

use crate::output::{print_json_lines, OutputFormat};

/// Job counts as reported by `status`
///
/// `failed` is always zero: no transition produces it. It stays in the
/// output so existing consumers keep parsing.
#[derive(Debug, Serialize)]
struct StatusStats {
    pending: u64,
    processing: u64,
    completed: u64,
    failed: u64,
    dead: u64,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    stats: StatusStats,
    workers: Vec<String>,
}

pub async fn enqueue(
    store: &dyn JobStore,
    output: OutputFormat,
    quiet: bool,
    job_json: &str,
) -> Result<()> {
    let mut job = NewJob::from_json(job_json).context("Invalid job")?;
    if job.max_retries.is_none() {
        job.max_retries = Some(load_default_max_retries(store).await?);
    }

    let job = store.add(job).await.map_err(|e| match e {
        StoreError::DuplicateJob(id) => anyhow::anyhow!("Job with id {} already exists", id),
        e => e.into(),
    })?;

    if output.is_text() {
        if quiet {
            println!("{}", job.id);
        } else {
            println!("Enqueued job {}", job.id);
        }
    } else {
        output.print_value(&job)?;
    }

    Ok(())
}

pub async fn status(
    store: &dyn JobStore,
    settings: &QueueSettings,
    output: OutputFormat,
) -> Result<()> {
    let counts = store.counts_by_state().await?;
    let workers = WorkerRegistry::new(&settings.workers_file)
        .read()
        .await
        .unwrap_or_else(|e| {
            warn!(path = %settings.workers_file.display(), "failed to read worker registry: {}", e);
            Vec::new()
        });

    let report = StatusReport {
        stats: StatusStats {
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: 0,
            dead: counts.dead,
        },
        workers,
    };

    if output.is_text() {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        output.print_value(&report)?;
    }

    Ok(())
}

pub async fn list(store: &dyn JobStore, output: OutputFormat, state: Option<JobState>) -> Result<()> {
    let jobs = store.list(state).await?;

    if output.is_text() {
        print_json_lines(&jobs)?;
    } else {
        output.print_value(&jobs)?;
    }

    Ok(())
}
