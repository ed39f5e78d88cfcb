//! JobStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobState, JobUpdate, NewJob};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A job with this id already exists
    #[error("job with id {0} already exists")]
    DuplicateJob(String),

    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The state machine does not allow this transition
    #[error("illegal transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: JobState,
        to: JobState,
    },

    /// DLQ retry against a job that is not dead
    #[error("job {id} is not in the dead letter queue (state: {state})")]
    NotInDeadLetterQueue { id: String, state: JobState },

    /// Lock could not be acquired in time; transient
    #[error("store contention: {0}")]
    Contention(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// A persisted value could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }
}

/// Number of jobs in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub dead: u64,
}

impl StateCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Dead => self.dead,
        }
    }

    pub(crate) fn increment(&mut self, state: JobState, by: u64) {
        match state {
            JobState::Pending => self.pending += by,
            JobState::Processing => self.processing += by,
            JobState::Completed => self.completed += by,
            JobState::Dead => self.dead += by,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.dead
    }
}

/// Store for jobs and queue configuration
///
/// Every operation is atomic and durable before it returns.
/// Implementations must be thread-safe and support concurrent access,
/// including from several processes when backed by a shared database.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Insert a new pending job
    ///
    /// Fails with [`StoreError::DuplicateJob`] if the id is taken; the
    /// existing record is left untouched.
    async fn add(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Get a job by id; `None` when absent
    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// List jobs ordered by `created_at`, optionally filtered by state
    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, StoreError>;

    /// Apply a partial update
    ///
    /// Rejects transitions the state machine does not allow with
    /// [`StoreError::IllegalTransition`]. Returns the updated record.
    async fn update_state(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError>;

    /// Move a job to the dead letter queue
    async fn move_to_dead(&self, id: &str, last_error: Option<String>) -> Result<Job, StoreError> {
        let mut update = JobUpdate::new(JobState::Dead);
        update.last_error = last_error;
        self.update_state(id, update).await
    }

    // =========================================================================
    // Claim
    // =========================================================================

    /// Atomically claim the oldest eligible job
    ///
    /// Selects the oldest (`created_at`, then `id`) pending job whose
    /// `next_run_at` is unset or not after `now`, moves it to `processing`
    /// and returns it. Two concurrent callers never receive the same job.
    /// Returns `None` when nothing is eligible.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    // =========================================================================
    // Dead Letter Queue
    // =========================================================================

    /// Return a dead job to `pending`
    ///
    /// Resets `attempts` to 0 and clears `next_run_at` and `last_error`.
    async fn retry_dead(&self, id: &str) -> Result<Job, StoreError>;

    // =========================================================================
    // Status
    // =========================================================================

    /// Count jobs per state
    async fn counts_by_state(&self) -> Result<StateCounts, StoreError>;

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Read a configuration value
    async fn get_config(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a configuration value (last write wins)
    async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a configuration value
    async fn delete_config(&self, key: &str) -> Result<(), StoreError>;
}
