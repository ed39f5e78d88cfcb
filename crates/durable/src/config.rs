//! Queue settings
//!
//! Process-level settings come from the environment ([`QueueSettings::from_env`]).
//! Tunables that must survive restarts live in the store's config table under
//! the names in [`keys`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::job::DEFAULT_MAX_RETRIES;
use crate::persistence::{JobStore, StoreError};
use crate::reliability::DEFAULT_BACKOFF_BASE;

/// Config table keys
pub mod keys {
    /// Exponential backoff base used by workers
    pub const BACKOFF_BASE: &str = "backoff_base";

    /// Retry ceiling for submissions that omit `max_retries`
    pub const MAX_RETRIES: &str = "max_retries";

    /// Present while a graceful worker stop is requested
    pub const STOP_REQUESTED: &str = "worker.stop_requested";
}

/// SQLite connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    /// Database file (created if missing)
    pub path: PathBuf,

    /// How long an operation waits for the database lock
    pub busy_timeout: Duration,

    /// Pool size per process
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("jobs.db"),
            busy_timeout: Duration::from_secs(30),
            max_connections: 4,
        }
    }
}

impl DatabaseSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }
}

/// Process-level settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub database: DatabaseSettings,

    /// Worker registry export read by `status`
    pub workers_file: PathBuf,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            workers_file: PathBuf::from("queuectl.workers.pids"),
        }
    }
}

impl QueueSettings {
    /// Create settings from environment variables
    ///
    /// Environment variables:
    /// - `QUEUECTL_DB`: database file (default: `jobs.db`)
    /// - `QUEUECTL_WORKERS_FILE`: worker registry file (default: `queuectl.workers.pids`)
    /// - `QUEUECTL_BUSY_TIMEOUT_MS`: database lock wait (default: 30000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let busy_timeout = env_parse::<u64>("QUEUECTL_BUSY_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.database.busy_timeout);

        Self {
            database: DatabaseSettings {
                path: std::env::var_os("QUEUECTL_DB")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.database.path),
                busy_timeout,
                max_connections: defaults.database.max_connections,
            },
            workers_file: std::env::var_os("QUEUECTL_WORKERS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workers_file),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparseable environment variable");
            None
        }
    }
}

/// Read a numeric tunable from the config table, falling back to `default`.
async fn load_u32(store: &dyn JobStore, key: &str, default: u32) -> Result<u32, StoreError> {
    let Some(raw) = store.get_config(key).await? else {
        return Ok(default);
    };
    match raw.trim().parse() {
        Ok(v) => Ok(v),
        Err(_) => {
            warn!(key, value = %raw, default, "ignoring unparseable config value");
            Ok(default)
        }
    }
}

/// Persisted backoff base, or [`DEFAULT_BACKOFF_BASE`].
pub async fn load_backoff_base(store: &dyn JobStore) -> Result<u32, StoreError> {
    load_u32(store, keys::BACKOFF_BASE, DEFAULT_BACKOFF_BASE).await
}

/// Persisted default retry ceiling, or [`DEFAULT_MAX_RETRIES`].
pub async fn load_default_max_retries(store: &dyn JobStore) -> Result<u32, StoreError> {
    load_u32(store, keys::MAX_RETRIES, DEFAULT_MAX_RETRIES).await
}
