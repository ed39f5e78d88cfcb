//! Job workers
//!
//! This module provides:
//! - [`CommandExecutor`] - runs a job's command line through the shell
//! - [`JobWorker`] - the claim, execute, record loop
//! - [`Supervisor`] - runs N workers as tasks with cooperative shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Supervisor                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │ Stop watcher │  │   Signals    │  │  Registry file   │   │
//! │  │ (store poll) │  │ (Ctrl-C/TERM)│  │ (observability)  │   │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────────────┘   │
//! │         └────────┬────────┘                                  │
//! │                  ▼                                           │
//! │         CancellationToken (shared)                           │
//! │                  │                                           │
//! │     ┌────────────┼────────────┐                              │
//! │     ▼            ▼            ▼                              │
//! │ [JobWorker 0] [JobWorker 1] ... [JobWorker N-1]              │
//! └─────────────────────────────────────────────────────────────┘
//!                    │
//!                    ▼
//!       JobStore::claim_next → CommandExecutor → JobStore::update_state
//! ```
//!
//! # Example
//!
//! ```ignore
//! use queuectl_durable::worker::{Supervisor, SupervisorConfig, WorkerConfig};
//!
//! let config = SupervisorConfig::new(4)
//!     .with_worker(WorkerConfig::default().with_backoff_base(3))
//!     .with_registry_path("queuectl.workers.pids");
//!
//! let supervisor = Supervisor::start(store, config).await?;
//! let report = supervisor.run_until_stopped().await;
//! ```

mod executor;
mod registry;
mod runner;
mod supervisor;

pub use executor::{CommandExecutor, ExecutionOutcome};
pub use registry::WorkerRegistry;
pub use runner::{JobOutcome, JobWorker, Tick, WorkerConfig, WorkerError};
pub use supervisor::{
    request_stop, shutdown_signal, ShutdownReport, StopReason, Supervisor, SupervisorConfig,
    SupervisorError, WorkerFailure,
};
