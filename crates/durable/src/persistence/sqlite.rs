//! SQLite implementation of JobStore
//!
//! Persistence shared by every worker process on the host:
//! - WAL journal so readers never block the writer
//! - `BEGIN IMMEDIATE` for every read-modify-write, which takes SQLite's single
//!   writer lock up front and serializes claims across processes
//! - Lock waits bounded by the configured busy timeout

use std::borrow::Cow;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite};
use tracing::{debug, error, info, instrument, warn};

use super::store::*;
use super::time;
use crate::config::DatabaseSettings;
use crate::job::{Job, JobState, JobUpdate, NewJob, DEFAULT_MAX_RETRIES};

/// SQLite implementation of JobStore
///
/// # Example
///
/// ```ignore
/// use queuectl_durable::{DatabaseSettings, SqliteJobStore};
///
/// let store = SqliteJobStore::open(&DatabaseSettings::new("jobs.db")).await?;
/// ```
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Wrap an existing pool; the schema must already be migrated
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file and apply migrations
    pub async fn open(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        let connect_options = SqliteConnectOptions::new()
            .filename(&settings.path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(settings.busy_timeout)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.busy_timeout)
            .connect_with(connect_options)
            .await
            .map_err(map_sqlx_error)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;

        debug!(
            path = %settings.path.display(),
            max_connections = settings.max_connections,
            "job store opened"
        );
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn begin_immediate(&self) -> Result<ImmediateTransaction, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        Ok(ImmediateTransaction {
            conn,
            finished: false,
        })
    }

    async fn try_claim(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut tx = self.begin_immediate().await?;

        let candidate = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE state = 'pending'
              AND (next_run_at IS NULL OR next_run_at <= ?)
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(time::encode(now))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let Some(candidate) = candidate else {
            tx.rollback().await?;
            return Ok(None);
        };
        let id: String = candidate.try_get("id").map_err(map_sqlx_error)?;

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'processing', updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(time::encode(Utc::now()))
        .bind(&id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let job = job_from_row(&row)?;
        tx.commit().await?;
        Ok(Some(job))
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn add(&self, job: NewJob) -> Result<Job, StoreError> {
        let now = time::encode(Utc::now());
        let max_retries = job.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at)
            VALUES (?, ?, 'pending', 0, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(i64::from(max_retries))
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::DuplicateJob(job.id.clone())
            }
            other => {
                error!("Failed to add job: {}", other);
                map_sqlx_error(other)
            }
        })?;

        debug!("added job");
        job_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, StoreError> {
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE state = ? ORDER BY created_at ASC, id ASC",
                )
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at ASC, id ASC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx_error)?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, update), fields(to = %update.state))]
    async fn update_state(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError> {
        let mut tx = self.begin_immediate().await?;

        let current = sqlx::query("SELECT state FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let Some(current) = current else {
            tx.rollback().await?;
            return Err(StoreError::JobNotFound(id.to_string()));
        };
        let from = state_from_row(&current)?;

        if !from.can_transition_to(update.state) {
            tx.rollback().await?;
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from,
                to: update.state,
            });
        }

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?,
                updated_at = ?,
                attempts = COALESCE(?, attempts),
                next_run_at = COALESCE(?, next_run_at),
                last_error = COALESCE(?, last_error)
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(update.state.as_str())
        .bind(time::encode(Utc::now()))
        .bind(update.attempts.map(i64::from))
        .bind(update.next_run_at.map(time::encode))
        .bind(&update.last_error)
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let job = job_from_row(&row)?;
        tx.commit().await?;

        debug!(%from, "updated job state");
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        match self.try_claim(now).await {
            Ok(Some(job)) => {
                debug!(job_id = %job.id, "claimed job");
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(StoreError::Contention(reason)) => {
                warn!(%reason, "claim skipped: store busy");
                Ok(None)
            }
            Err(e) => {
                error!("Failed to claim job: {}", e);
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    async fn retry_dead(&self, id: &str) -> Result<Job, StoreError> {
        let mut tx = self.begin_immediate().await?;

        let current = sqlx::query("SELECT state FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let Some(current) = current else {
            tx.rollback().await?;
            return Err(StoreError::JobNotFound(id.to_string()));
        };
        let state = state_from_row(&current)?;

        if state != JobState::Dead {
            tx.rollback().await?;
            return Err(StoreError::NotInDeadLetterQueue {
                id: id.to_string(),
                state,
            });
        }

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending',
                attempts = 0,
                next_run_at = NULL,
                last_error = NULL,
                updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(time::encode(Utc::now()))
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let job = job_from_row(&row)?;
        tx.commit().await?;

        info!(job_id = %id, "job requeued from dead letter queue");
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn counts_by_state(&self) -> Result<StateCounts, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut counts = StateCounts::default();
        for row in rows {
            let state = state_from_row(&row)?;
            let n: i64 = row.try_get("n").map_err(map_sqlx_error)?;
            counts.increment(state, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => row.try_get("value").map_err(map_sqlx_error),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, value))]
    async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        debug!("config updated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_config(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM config WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

/// A transaction opened with `BEGIN IMMEDIATE`.
///
/// sqlx's own transactions start deferred, which lets two connections both
/// read and then deadlock when upgrading to a writer. An unfinished
/// transaction closes its connection on drop so the lock is released.
struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    async fn commit(mut self) -> Result<(), StoreError> {
        sqlx::query("COMMIT")
            .execute(&mut *self.conn)
            .await
            .map_err(map_sqlx_error)?;
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        sqlx::query("ROLLBACK")
            .execute(&mut *self.conn)
            .await
            .map_err(map_sqlx_error)?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            // Extended result codes keep the primary code in the low byte.
            let primary = db
                .code()
                .map(Cow::into_owned)
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xff);
            if matches!(primary, Some(5) | Some(6)) {
                return true;
            }
            let msg = db.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    if is_busy(&err) {
        StoreError::Contention(err.to_string())
    } else {
        StoreError::Database(err.to_string())
    }
}

fn state_from_row(row: &SqliteRow) -> Result<JobState, StoreError> {
    let raw: String = row.try_get("state").map_err(map_sqlx_error)?;
    raw.parse()
        .map_err(|e: crate::job::ParseJobStateError| StoreError::Corrupt(e.to_string()))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let get_u32 = |column: &str| -> Result<u32, StoreError> {
        let value: i64 = row.try_get(column).map_err(map_sqlx_error)?;
        u32::try_from(value)
            .map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
    };
    let created_at: String = row.try_get("created_at").map_err(map_sqlx_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(map_sqlx_error)?;
    let next_run_at: Option<String> = row.try_get("next_run_at").map_err(map_sqlx_error)?;

    Ok(Job {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        command: row.try_get("command").map_err(map_sqlx_error)?,
        state: state_from_row(row)?,
        attempts: get_u32("attempts")?,
        max_retries: get_u32("max_retries")?,
        created_at: time::decode(&created_at)?,
        updated_at: time::decode(&updated_at)?,
        next_run_at: next_run_at.as_deref().map(time::decode).transpose()?,
        last_error: row.try_get("last_error").map_err(map_sqlx_error)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::open(&DatabaseSettings::new(dir.path().join("jobs.db")))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let settings = DatabaseSettings::new(dir.path().join("jobs.db"));

        let first = SqliteJobStore::open(&settings).await.unwrap();
        first.add(NewJob::new("a", "true")).await.unwrap();
        first.close().await;

        let second = SqliteJobStore::open(&settings).await.unwrap();
        assert!(second.get("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let (_dir, store) = open_temp().await;
        store.add(NewJob::new("a", "true")).await.unwrap();
        sqlx::query("UPDATE jobs SET state = 'failed' WHERE id = 'a'")
            .execute(store.pool())
            .await
            .unwrap();

        assert!(matches!(
            store.get("a").await.unwrap_err(),
            StoreError::Corrupt(_)
        ));
    }

    #[tokio::test]
    async fn test_timestamps_round_trip_through_rows() {
        let (_dir, store) = open_temp().await;
        let added = store.add(NewJob::new("a", "true")).await.unwrap();
        let fetched = store.get("a").await.unwrap().unwrap();
        assert_eq!(added, fetched);
    }

    #[tokio::test]
    async fn test_counts_by_state() {
        let (_dir, store) = open_temp().await;
        store.add(NewJob::new("a", "true")).await.unwrap();
        store.add(NewJob::new("b", "true")).await.unwrap();
        store.claim_next(Utc::now()).await.unwrap().unwrap();

        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.total(), 2);
    }

    #[tokio::test]
    async fn test_claim_while_locked_elsewhere_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let settings = DatabaseSettings::new(dir.path().join("jobs.db"))
            .with_busy_timeout(std::time::Duration::from_millis(100));
        let store = SqliteJobStore::open(&settings).await.unwrap();
        let other = SqliteJobStore::open(&settings).await.unwrap();
        store.add(NewJob::new("a", "true")).await.unwrap();

        let mut holder = other.pool().acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *holder)
            .await
            .unwrap();

        assert_eq!(store.claim_next(Utc::now()).await.unwrap(), None);

        sqlx::query("ROLLBACK").execute(&mut *holder).await.unwrap();
        drop(holder);

        let claimed = store.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, "a");
    }

    #[test]
    fn test_non_database_errors_are_not_contention() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            StoreError::Database(_)
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            StoreError::Contention(_)
        ));
    }
}
