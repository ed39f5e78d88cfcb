// Dead letter queue commands

use anyhow::Result;
use clap::Subcommand;
use queuectl_durable::persistence::{JobStore, StoreError};
use queuectl_durable::JobState;

use crate::output::{print_json_lines, OutputFormat};

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List dead jobs
    List,

    /// Move a dead job back to pending with its attempts reset
    Retry {
        /// Job ID
        job_id: String,
    },
}

pub async fn run(
    command: DlqCommand,
    store: &dyn JobStore,
    output: OutputFormat,
    quiet: bool,
) -> Result<()> {
    match command {
        DlqCommand::List => list(store, output).await,
        DlqCommand::Retry { job_id } => retry(store, output, quiet, &job_id).await,
    }
}

async fn list(store: &dyn JobStore, output: OutputFormat) -> Result<()> {
    let jobs = store.list(Some(JobState::Dead)).await?;

    if output.is_text() {
        print_json_lines(&jobs)?;
    } else {
        output.print_value(&jobs)?;
    }

    Ok(())
}

async fn retry(store: &dyn JobStore, output: OutputFormat, quiet: bool, job_id: &str) -> Result<()> {
    let job = store.retry_dead(job_id).await.map_err(|e| match e {
        StoreError::JobNotFound(id) => anyhow::anyhow!("Job not found: {}", id),
        StoreError::NotInDeadLetterQueue { id, state } => {
            anyhow::anyhow!("Job {} is not in the DLQ (state: {})", id, state)
        }
        e => e.into(),
    })?;

    if output.is_text() {
        if !quiet {
            println!("Job {} retried (moved to pending)", job.id);
        }
    } else {
        output.print_value(&job)?;
    }

    Ok(())
}
