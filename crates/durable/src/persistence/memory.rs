//! In-memory implementation of JobStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::store::*;
use super::time;
use crate::job::{Job, JobState, JobUpdate, NewJob, DEFAULT_MAX_RETRIES};

/// In-memory implementation of JobStore
///
/// This is primarily for testing and embedding. It keeps all data in memory
/// and provides the same semantics as the SQLite implementation; every
/// operation runs under a single lock, so claims are exclusive.
///
/// # Example
///
/// ```
/// use queuectl_durable::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// assert_eq!(store.job_count(), 0);
/// ```
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
    config: RwLock<HashMap<String, String>>,
}

impl InMemoryJobStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            config: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of jobs
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.jobs.write().clear();
        self.config.write().clear();
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn timestamp() -> DateTime<Utc> {
    time::truncate(Utc::now())
}

fn sorted(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    jobs
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn add(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateJob(job.id));
        }

        let now = timestamp();
        let record = Job {
            id: job.id.clone(),
            command: job.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: job.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            created_at: now,
            updated_at: now,
            next_run_at: None,
            last_error: None,
        };
        jobs.insert(job.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().get(id).cloned())
    }

    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read();
        let matching = jobs
            .values()
            .filter(|j| state.map_or(true, |s| s == j.state))
            .cloned()
            .collect();
        Ok(sorted(matching))
    }

    async fn update_state(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;

        if !job.state.can_transition_to(update.state) {
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from: job.state,
                to: update.state,
            });
        }

        update.apply(job, timestamp());
        Ok(job.clone())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write();
        let next_id = jobs
            .values()
            .filter(|j| j.is_eligible(now))
            .min_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
            .map(|j| j.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };

        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Processing;
        job.updated_at = timestamp();
        Ok(Some(job.clone()))
    }

    async fn retry_dead(&self, id: &str) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;

        if job.state != JobState::Dead {
            return Err(StoreError::NotInDeadLetterQueue {
                id: id.to_string(),
                state: job.state,
            });
        }

        job.state = JobState::Pending;
        job.attempts = 0;
        job.next_run_at = None;
        job.last_error = None;
        job.updated_at = timestamp();
        Ok(job.clone())
    }

    async fn counts_by_state(&self) -> Result<StateCounts, StoreError> {
        let mut counts = StateCounts::default();
        for job in self.jobs.read().values() {
            counts.increment(job.state, 1);
        }
        Ok(counts)
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.config.read().get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.config
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_config(&self, key: &str) -> Result<(), StoreError> {
        self.config.write().remove(key);
        Ok(())
    }
}
