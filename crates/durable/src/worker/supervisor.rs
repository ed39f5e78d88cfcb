//! Worker supervisor
//!
//! Spawns N [`JobWorker`] tasks sharing one cancellation token and keeps
//! their handles. A stop can come from:
//! - a shutdown signal (Ctrl-C / SIGTERM)
//! - a persisted stop request written by another process (`worker stop`)
//! - [`Supervisor::request_stop`] in this process
//!
//! Shutdown is cooperative: workers finish their current job, and the
//! supervisor waits for them up to a grace period.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::registry::WorkerRegistry;
use super::runner::{JobWorker, WorkerConfig, WorkerError};
use crate::config::keys;
use crate::persistence::{JobStore, StoreError};

/// Supervisor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Number of workers to run
    pub worker_count: usize,

    /// Template for each worker; the id is replaced per worker
    pub worker: WorkerConfig,

    /// How long shutdown waits for workers to exit
    pub shutdown_timeout: Duration,

    /// How often the persisted stop request is checked
    pub stop_poll_interval: Duration,

    /// Registry file to write (None = no registry)
    pub registry_path: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            worker: WorkerConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
            stop_poll_interval: Duration::from_secs(1),
            registry_path: None,
        }
    }
}

impl SupervisorConfig {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Default::default()
        }
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_stop_poll_interval(mut self, interval: Duration) -> Self {
        self.stop_poll_interval = interval;
        self
    }

    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = Some(path.into());
        self
    }
}

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Asked to start zero workers
    #[error("worker count must be at least 1")]
    NoWorkers,
}

/// Why the supervisor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Ctrl-C, SIGTERM or the caller's shutdown future
    Signal,
    /// Persisted or in-process stop request
    StopRequested,
    /// Every worker exited on its own
    WorkersExited,
}

/// A worker that ended with an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerFailure {
    pub worker_id: String,
    pub error: String,
}

/// Outcome of a shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub reason: StopReason,

    /// Workers that exited cleanly
    pub stopped: Vec<String>,

    /// Workers that ended with an error or panicked
    pub failed: Vec<WorkerFailure>,

    /// Workers still busy when the grace period ran out
    pub timed_out: Vec<String>,
}

impl ShutdownReport {
    /// All workers stopped cleanly in time
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

struct WorkerHandle {
    id: String,
    handle: JoinHandle<Result<(), WorkerError>>,
}

/// Runs and stops a set of workers
pub struct Supervisor {
    config: SupervisorConfig,
    cancel: CancellationToken,
    workers: Vec<WorkerHandle>,
    // Yields `None` once every worker task has dropped its sender.
    exited_rx: mpsc::Receiver<()>,
    stop_watcher: JoinHandle<()>,
    registry: Option<WorkerRegistry>,
}

impl Supervisor {
    /// Spawn the workers and the stop watcher
    ///
    /// Clears any stale persisted stop request first, so a previous
    /// `worker stop` does not end this run immediately.
    #[instrument(skip(store, config), fields(worker_count = config.worker_count))]
    pub async fn start(
        store: Arc<dyn JobStore>,
        config: SupervisorConfig,
    ) -> Result<Self, SupervisorError> {
        if config.worker_count == 0 {
            return Err(SupervisorError::NoWorkers);
        }

        store.delete_config(keys::STOP_REQUESTED).await?;

        let cancel = CancellationToken::new();
        let (exited_tx, exited_rx) = mpsc::channel::<()>(1);
        let pid = std::process::id();

        let mut workers = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let id = format!("w-{pid}-{index}");
            let worker_config = WorkerConfig {
                worker_id: id.clone(),
                ..config.worker.clone()
            };
            let worker = JobWorker::new(Arc::clone(&store), worker_config);
            let cancel = cancel.clone();
            let exited_tx = exited_tx.clone();

            let handle = tokio::spawn(async move {
                let result = worker.run(cancel).await;
                drop(exited_tx);
                result
            });
            info!(worker_id = %id, "started worker");
            workers.push(WorkerHandle { id, handle });
        }
        drop(exited_tx);

        let registry = config.registry_path.clone().map(WorkerRegistry::new);
        if let Some(registry) = &registry {
            let ids: Vec<String> = workers.iter().map(|w| w.id.clone()).collect();
            if let Err(e) = registry.write(&ids).await {
                warn!(path = %registry.path().display(), "failed to write worker registry: {}", e);
            }
        }

        let stop_watcher = tokio::spawn(watch_stop_request(
            store,
            cancel.clone(),
            config.stop_poll_interval,
        ));

        info!("all workers started");
        Ok(Self {
            config,
            cancel,
            workers,
            exited_rx,
            stop_watcher,
            registry,
        })
    }

    /// Ids of the spawned workers
    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.id.clone()).collect()
    }

    /// Ask every worker to stop after its current job
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Token shared by all workers
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until Ctrl-C / SIGTERM, a stop request or all workers exiting,
    /// then shut down
    pub async fn run_until_stopped(self) -> ShutdownReport {
        self.run_until(shutdown_signal()).await
    }

    /// Like [`Supervisor::run_until_stopped`] with a caller-supplied signal
    pub async fn run_until<F>(mut self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        let reason = tokio::select! {
            biased;
            _ = signal => StopReason::Signal,
            _ = self.cancel.cancelled() => StopReason::StopRequested,
            _ = self.exited_rx.recv() => {
                // Cancelled workers exit at once; attribute that to the stop.
                if self.cancel.is_cancelled() {
                    StopReason::StopRequested
                } else {
                    StopReason::WorkersExited
                }
            }
        };
        info!(?reason, "stopping workers");
        self.finish(reason).await
    }

    /// Stop all workers and wait for them up to the grace period
    pub async fn shutdown(self) -> ShutdownReport {
        self.finish(StopReason::StopRequested).await
    }

    async fn finish(self, reason: StopReason) -> ShutdownReport {
        self.cancel.cancel();
        self.stop_watcher.abort();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let results = futures::future::join_all(self.workers.into_iter().map(|w| async move {
            let result = tokio::time::timeout_at(deadline, w.handle).await;
            (w.id, result)
        }))
        .await;

        let mut report = ShutdownReport {
            reason,
            stopped: Vec::new(),
            failed: Vec::new(),
            timed_out: Vec::new(),
        };
        for (worker_id, result) in results {
            match result {
                Ok(Ok(Ok(()))) => report.stopped.push(worker_id),
                Ok(Ok(Err(e))) => report.failed.push(WorkerFailure {
                    worker_id,
                    error: e.to_string(),
                }),
                Ok(Err(join_error)) => {
                    error!(%worker_id, "worker task failed: {}", join_error);
                    report.failed.push(WorkerFailure {
                        worker_id,
                        error: join_error.to_string(),
                    });
                }
                Err(_) => {
                    warn!(%worker_id, "worker still running after shutdown timeout");
                    report.timed_out.push(worker_id);
                }
            }
        }

        if let Some(registry) = &self.registry {
            if let Err(e) = registry.remove().await {
                warn!(path = %registry.path().display(), "failed to remove worker registry: {}", e);
            }
        }

        info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            "shutdown complete"
        );
        report
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("workers", &self.worker_ids())
            .finish_non_exhaustive()
    }
}

/// Persist a stop request for every supervisor sharing the store
pub async fn request_stop(store: &dyn JobStore) -> Result<(), StoreError> {
    store.set_config(keys::STOP_REQUESTED, "1").await
}

async fn watch_stop_request(
    store: Arc<dyn JobStore>,
    cancel: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match store.get_config(keys::STOP_REQUESTED).await {
            Ok(Some(_)) => {
                info!("stop request found in store");
                cancel.cancel();
                return;
            }
            Ok(None) => {}
            Err(e) => debug!("stop request check failed: {}", e),
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C."),
            Err(e) => {
                warn!("failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM.");
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
