//! Worker execution loop
//!
//! A [`JobWorker`] repeatedly claims the next eligible job, runs its command
//! and records the outcome, retrying failures with exponential backoff until
//! the job's retry budget is spent and it moves to the dead letter queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, warn, Instrument};

use super::executor::{CommandExecutor, ExecutionOutcome};
use crate::job::{Job, JobState, JobUpdate};
use crate::persistence::{JobStore, StoreError};
use crate::reliability::{backoff, DEFAULT_BACKOFF_BASE};

// Keeps `next_run_at` representable for huge bases.
const MAX_DELAY_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Identifier used in logs and the worker registry
    pub worker_id: String,

    /// Base of the exponential retry delay
    pub backoff_base: u32,

    /// Per-job command timeout (None = unbounded)
    pub job_timeout: Option<Duration>,

    /// Pause between polls when nothing is claimable
    pub idle_interval: Duration,

    /// Consecutive store errors tolerated before the loop gives up
    pub max_store_failures: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("w-{}-0", std::process::id()),
            backoff_base: DEFAULT_BACKOFF_BASE,
            job_timeout: None,
            idle_interval: Duration::from_secs(1),
            max_store_failures: 10,
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Set the backoff base
    pub fn with_backoff_base(mut self, base: u32) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set the per-job timeout
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Set the idle poll interval
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Set the store failure tolerance
    pub fn with_max_store_failures(mut self, max: u32) -> Self {
        self.max_store_failures = max.max(1);
        self
    }
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The store kept failing; the loop stopped
    #[error("store unavailable after {failures} consecutive failures: {source}")]
    StoreUnavailable {
        failures: u32,
        #[source]
        source: StoreError,
    },
}

/// What happened to a processed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Command succeeded; job is terminal
    Completed { job_id: String },

    /// Command failed; job is pending again after a delay
    Retrying {
        job_id: String,
        attempts: u32,
        next_run_at: DateTime<Utc>,
    },

    /// Retry budget exhausted; job is in the dead letter queue
    Dead { job_id: String, attempts: u32 },
}

impl JobOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            JobOutcome::Completed { job_id }
            | JobOutcome::Retrying { job_id, .. }
            | JobOutcome::Dead { job_id, .. } => job_id,
        }
    }
}

/// Result of a single poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was claimable
    Idle,

    /// One job was claimed, executed and recorded
    Processed(JobOutcome),
}

/// Runs the claim-execute-record loop against a [`JobStore`]
pub struct JobWorker {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    executor: CommandExecutor,
}

impl JobWorker {
    /// Create a new worker
    pub fn new(store: Arc<dyn JobStore>, config: WorkerConfig) -> Self {
        let executor = CommandExecutor::new().with_timeout(config.job_timeout);
        Self {
            store,
            config,
            executor,
        }
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until `cancel` fires or the store is unavailable
    ///
    /// The stop signal is checked between jobs only: a running command is
    /// never interrupted, it finishes (or times out) first.
    #[instrument(skip(self, cancel), fields(worker_id = %self.config.worker_id))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        info!(
            backoff_base = self.config.backoff_base,
            job_timeout_secs = self.config.job_timeout.map(|t| t.as_secs_f64()),
            "worker started"
        );

        let mut consecutive_failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                info!("stop requested, worker exiting");
                return Ok(());
            }

            match self.run_once().await {
                Ok(Tick::Processed(_)) => {
                    consecutive_failures = 0;
                    continue;
                }
                Ok(Tick::Idle) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.max_store_failures {
                        error!(
                            failures = consecutive_failures,
                            "store unavailable, worker exiting: {}", e
                        );
                        return Err(WorkerError::StoreUnavailable {
                            failures: consecutive_failures,
                            source: e,
                        });
                    }
                    warn!(failures = consecutive_failures, "store error: {}", e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.idle_interval) => {}
            }
        }
    }

    /// Claim at most one job, execute it and record the outcome
    pub async fn run_once(&self) -> Result<Tick, StoreError> {
        let Some(job) = self.store.claim_next(Utc::now()).await? else {
            return Ok(Tick::Idle);
        };

        let span = info_span!("job", job_id = %job.id, attempts = job.attempts);
        async move {
            info!(command = %job.command, "claimed job");
            let outcome = self.executor.execute(&job.command).await;
            self.record(&job, outcome).await.map(Tick::Processed)
        }
        .instrument(span)
        .await
    }

    async fn record(&self, job: &Job, outcome: ExecutionOutcome) -> Result<JobOutcome, StoreError> {
        let diagnostic = outcome.diagnostic();

        if outcome.is_success() {
            let mut update = JobUpdate::new(JobState::Completed).with_attempts(job.attempts);
            update.last_error = diagnostic;
            self.persist(&job.id, update).await?;
            info!("job completed");
            return Ok(JobOutcome::Completed {
                job_id: job.id.clone(),
            });
        }

        let attempts = job.attempts.saturating_add(1);
        if attempts > job.max_retries {
            let mut update = JobUpdate::new(JobState::Dead).with_attempts(attempts);
            update.last_error = diagnostic;
            self.persist(&job.id, update).await?;
            warn!(attempts, "job moved to dead letter queue");
            return Ok(JobOutcome::Dead {
                job_id: job.id.clone(),
                attempts,
            });
        }

        let delay_secs = i64::try_from(backoff(self.config.backoff_base, attempts))
            .unwrap_or(i64::MAX)
            .min(MAX_DELAY_SECS);
        let next_run_at = Utc::now() + TimeDelta::seconds(delay_secs);
        let mut update = JobUpdate::new(JobState::Pending)
            .with_attempts(attempts)
            .with_next_run_at(next_run_at);
        update.last_error = diagnostic;
        self.persist(&job.id, update).await?;

        info!(attempts, delay_secs, "job failed, will retry");
        Ok(JobOutcome::Retrying {
            job_id: job.id.clone(),
            attempts,
            next_run_at,
        })
    }

    /// Write a job's outcome, retrying on contention
    ///
    /// The job stays `processing` until this lands; no other worker claims it.
    async fn persist(&self, job_id: &str, update: JobUpdate) -> Result<(), StoreError> {
        let mut tries = 1u32;
        loop {
            match self.store.update_state(job_id, update.clone()).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() && tries < self.config.max_store_failures => {
                    warn!(tries, "store busy while recording outcome: {}", e);
                    tries += 1;
                    tokio::time::sleep(self.config.idle_interval).await;
                }
                Err(e) => {
                    error!(tries, "failed to record job outcome: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

impl std::fmt::Debug for JobWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::job::NewJob;
    use crate::persistence::{InMemoryJobStore, StateCounts};

    fn worker(store: &Arc<InMemoryJobStore>, base: u32) -> JobWorker {
        let store: Arc<dyn JobStore> = store.clone();
        JobWorker::new(
            store,
            WorkerConfig::new("w-test-0")
                .with_backoff_base(base)
                .with_idle_interval(Duration::from_millis(20)),
        )
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let store = Arc::new(InMemoryJobStore::new());
        assert_eq!(worker(&store, 2).run_once().await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn test_success_keeps_attempts_and_records_stdout() {
        let store = Arc::new(InMemoryJobStore::new());
        store.add(NewJob::new("s1", "echo hello")).await.unwrap();

        let tick = worker(&store, 2).run_once().await.unwrap();
        assert_eq!(
            tick,
            Tick::Processed(JobOutcome::Completed {
                job_id: "s1".to_string()
            })
        );

        let job = store.get("s1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error.as_deref(), Some("hello\n"));
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_with_backoff() {
        let store = Arc::new(InMemoryJobStore::new());
        store.add(NewJob::new("f1", "exit 3")).await.unwrap();

        let before = Utc::now();
        let tick = worker(&store, 3).run_once().await.unwrap();
        let Tick::Processed(JobOutcome::Retrying {
            attempts,
            next_run_at,
            ..
        }) = tick
        else {
            panic!("expected retry, got {tick:?}");
        };
        assert_eq!(attempts, 1);
        assert!(next_run_at >= before + TimeDelta::seconds(3));

        let job = store.get("f1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().starts_with("rc=3;"));
    }

    #[tokio::test]
    async fn test_zero_retries_goes_straight_to_dead() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .add(NewJob::new("f0", "exit 1").with_max_retries(0))
            .await
            .unwrap();

        let tick = worker(&store, 2).run_once().await.unwrap();
        assert_eq!(
            tick,
            Tick::Processed(JobOutcome::Dead {
                job_id: "f0".to_string(),
                attempts: 1
            })
        );
        let job = store.get("f0").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_stop_while_idle_exits_promptly() {
        let store = Arc::new(InMemoryJobStore::new());
        let worker = worker(&store, 2).with_idle(Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_contended_outcome_write_is_retried() {
        let store = Arc::new(FlakyStore::default());
        store.update_contention.store(2, Ordering::SeqCst);
        store.inner.add(NewJob::new("c1", "true")).await.unwrap();

        let worker = JobWorker::new(
            store.clone(),
            WorkerConfig::new("w-test-0").with_idle_interval(Duration::from_millis(10)),
        );
        let tick = worker.run_once().await.unwrap();
        assert_eq!(
            tick,
            Tick::Processed(JobOutcome::Completed {
                job_id: "c1".to_string()
            })
        );
        assert_eq!(store.update_contention.load(Ordering::SeqCst), 0);
        let job = store.inner.get("c1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_persistent_store_errors_end_the_loop() {
        let store = Arc::new(FlakyStore {
            claim_fails: true,
            ..Default::default()
        });
        let worker = JobWorker::new(
            store,
            WorkerConfig::new("w-test-0")
                .with_idle_interval(Duration::from_millis(5))
                .with_max_store_failures(3),
        );

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            worker.run(CancellationToken::new()),
        )
        .await
        .expect("worker did not give up");
        match result {
            Err(WorkerError::StoreUnavailable { failures, source }) => {
                assert_eq!(failures, 3);
                assert!(matches!(source, StoreError::Database(_)));
            }
            other => panic!("expected StoreUnavailable, got {other:?}"),
        }
    }

    /// In-memory store that can fail claims or contend on updates
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryJobStore,
        claim_fails: bool,
        update_contention: AtomicU32,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn add(&self, job: NewJob) -> Result<Job, StoreError> {
            self.inner.add(job).await
        }

        async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
            self.inner.get(id).await
        }

        async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, StoreError> {
            self.inner.list(state).await
        }

        async fn update_state(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError> {
            let remaining = self.update_contention.load(Ordering::SeqCst);
            if remaining > 0 {
                self.update_contention.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Contention("database is locked".to_string()));
            }
            self.inner.update_state(id, update).await
        }

        async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
            if self.claim_fails {
                return Err(StoreError::Database("disk I/O error".to_string()));
            }
            self.inner.claim_next(now).await
        }

        async fn retry_dead(&self, id: &str) -> Result<Job, StoreError> {
            self.inner.retry_dead(id).await
        }

        async fn counts_by_state(&self) -> Result<StateCounts, StoreError> {
            self.inner.counts_by_state().await
        }

        async fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get_config(key).await
        }

        async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.set_config(key, value).await
        }

        async fn delete_config(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete_config(key).await
        }
    }

    impl JobWorker {
        fn with_idle(mut self, interval: Duration) -> Self {
            self.config.idle_interval = interval;
            self
        }
    }
}
