// Persisted configuration commands

use anyhow::{bail, Result};
use clap::Subcommand;
use queuectl_durable::config::keys;
use queuectl_durable::persistence::JobStore;
use serde::Serialize;

use crate::output::OutputFormat;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print a value (empty when unset)
    Get {
        /// Config key
        key: String,
    },

    /// Set a value
    Set {
        /// Config key
        key: String,

        /// New value
        value: String,
    },
}

#[derive(Debug, Serialize)]
struct ConfigEntry<'a> {
    key: &'a str,
    value: Option<&'a str>,
}

pub async fn run(command: ConfigCommand, store: &dyn JobStore, output: OutputFormat) -> Result<()> {
    match command {
        ConfigCommand::Get { key } => get(store, output, &key).await,
        ConfigCommand::Set { key, value } => set(store, output, &key, &value).await,
    }
}

async fn get(store: &dyn JobStore, output: OutputFormat, key: &str) -> Result<()> {
    let value = store.get_config(key).await?;

    if output.is_text() {
        println!("{}", value.as_deref().unwrap_or(""));
    } else {
        output.print_value(&ConfigEntry {
            key,
            value: value.as_deref(),
        })?;
    }

    Ok(())
}

async fn set(store: &dyn JobStore, output: OutputFormat, key: &str, value: &str) -> Result<()> {
    validate(key, value)?;
    store.set_config(key, value).await?;

    if output.is_text() {
        println!("config {} set to {}", key, value);
    } else {
        output.print_value(&ConfigEntry {
            key,
            value: Some(value),
        })?;
    }

    Ok(())
}

/// Numeric tunables must parse; other keys are free-form
fn validate(key: &str, value: &str) -> Result<()> {
    if matches!(key, keys::BACKOFF_BASE | keys::MAX_RETRIES) && value.trim().parse::<u32>().is_err()
    {
        bail!("{} must be a non-negative integer, got {:?}", key, value);
    }
    Ok(())
}
