//! # Durable Job Queue
//!
//! A SQLite-backed job queue for shell commands, shared by several worker
//! processes on one host.
//!
//! ## Features
//!
//! - **Explicit state machine**: `pending → processing → completed | pending | dead`, checked on every write
//! - **Exclusive claims**: `BEGIN IMMEDIATE` transactions guarantee at most one worker per job
//! - **Automatic retries**: exponential backoff (`max(1, base^attempts)`) and a dead letter queue
//! - **Cooperative shutdown**: workers finish their current job before exiting
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Supervisor                            │
//! │  (spawns JobWorker tasks, stop watcher, signal handling)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        JobWorker                             │
//! │  (claims jobs, runs commands, records outcome + backoff)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         JobStore                             │
//! │  (SQLite: jobs, config)                                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use queuectl_durable::prelude::*;
//!
//! let store = Arc::new(SqliteJobStore::open(&DatabaseSettings::new("jobs.db")).await?);
//! store.add(NewJob::new("build", "make all")).await?;
//!
//! let worker = JobWorker::new(store, WorkerConfig::new("w-1"));
//! worker.run_once().await?;
//! ```

pub mod config;
pub mod job;
pub mod persistence;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{DatabaseSettings, QueueSettings};
    pub use crate::job::{Job, JobState, JobUpdate, NewJob, ValidationError};
    pub use crate::persistence::{
        InMemoryJobStore, JobStore, SqliteJobStore, StateCounts, StoreError,
    };
    pub use crate::reliability::backoff;
    pub use crate::worker::{
        JobWorker, ShutdownReport, Supervisor, SupervisorConfig, WorkerConfig, WorkerError,
    };
}

// Re-export key types at crate root
pub use config::{DatabaseSettings, QueueSettings};
pub use job::{Job, JobState, JobUpdate, NewJob, ValidationError, DEFAULT_MAX_RETRIES};
pub use persistence::{InMemoryJobStore, JobStore, SqliteJobStore, StateCounts, StoreError};
pub use reliability::{backoff, backoff_delay, DEFAULT_BACKOFF_BASE};
pub use worker::{
    CommandExecutor, ExecutionOutcome, JobOutcome, JobWorker, ShutdownReport, StopReason,
    Supervisor, SupervisorConfig, SupervisorError, Tick, WorkerConfig, WorkerError,
};
