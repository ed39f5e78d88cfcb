//! End-to-end worker tests against a SQLite store
//!
//! Commands run through `sh -c`, so these tests are unix-only.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use queuectl_durable::config::keys;
use queuectl_durable::persistence::{JobStore, SqliteJobStore};
use queuectl_durable::worker::{
    request_stop, JobOutcome, JobWorker, StopReason, Supervisor, SupervisorConfig, Tick,
    WorkerConfig, WorkerRegistry,
};
use queuectl_durable::{DatabaseSettings, JobState, NewJob};

async fn create_test_store() -> (TempDir, Arc<SqliteJobStore>) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let store = SqliteJobStore::open(&DatabaseSettings::new(dir.path().join("jobs.db")))
        .await
        .expect("failed to open store");
    (dir, Arc::new(store))
}

fn fast_worker(id: &str) -> WorkerConfig {
    WorkerConfig::new(id)
        .with_backoff_base(0)
        .with_idle_interval(Duration::from_millis(25))
}

/// Poll until `id` reaches `state` or the timeout expires
async fn wait_for_state(store: &dyn JobStore, id: &str, state: JobState, timeout: Duration) {
    tokio::time::timeout(timeout, async {
        loop {
            if let Some(job) = store.get(id).await.unwrap() {
                if job.state == state {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {id} never reached {state}"));
}

// ============================================
// Worker Loop
// ============================================

#[test_log::test(tokio::test)]
async fn test_successful_job_completes() {
    let (_dir, store) = create_test_store().await;
    store.add(NewJob::new("s1", "echo hello")).await.unwrap();

    let worker = JobWorker::new(store.clone(), fast_worker("w-test-0"));
    let tick = worker.run_once().await.unwrap();
    assert!(matches!(tick, Tick::Processed(JobOutcome::Completed { .. })));

    let job = store.get("s1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.last_error.as_deref(), Some("hello\n"));
    assert_eq!(worker.run_once().await.unwrap(), Tick::Idle);
}

#[test_log::test(tokio::test)]
async fn test_failing_job_dies_after_retries() {
    let (_dir, store) = create_test_store().await;
    store
        .add(NewJob::new("f1", "echo nope >&2; exit 2").with_max_retries(2))
        .await
        .unwrap();

    let worker = JobWorker::new(store.clone(), fast_worker("w-test-0"));
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    // base 0 gives a one second delay per retry
    wait_for_state(store.as_ref(), "f1", JobState::Dead, Duration::from_secs(15)).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let job = store.get("f1").await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    let last_error = job.last_error.unwrap();
    assert!(last_error.starts_with("rc=2;"), "{last_error}");
    assert!(last_error.contains("stderr=nope"), "{last_error}");
}

#[test_log::test(tokio::test)]
async fn test_retry_delay_blocks_reclaim() {
    let (_dir, store) = create_test_store().await;
    store.add(NewJob::new("f1", "exit 1")).await.unwrap();

    let worker = JobWorker::new(
        store.clone(),
        WorkerConfig::new("w-test-0").with_backoff_base(10),
    );
    let tick = worker.run_once().await.unwrap();
    assert!(matches!(
        tick,
        Tick::Processed(JobOutcome::Retrying { attempts: 1, .. })
    ));

    // 10 seconds away
    assert_eq!(worker.run_once().await.unwrap(), Tick::Idle);
    let job = store.get("f1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert!(job.next_run_at.is_some());
}

#[test_log::test(tokio::test)]
async fn test_outcome_recorded_after_lock_held_elsewhere() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let settings = DatabaseSettings::new(dir.path().join("jobs.db"))
        .with_busy_timeout(Duration::from_millis(300));
    let store = Arc::new(SqliteJobStore::open(&settings).await.unwrap());
    let other = SqliteJobStore::open(&settings).await.unwrap();
    store
        .add(NewJob::new("c1", "sleep 0.5; exit 1"))
        .await
        .unwrap();

    let worker = JobWorker::new(
        store.clone(),
        WorkerConfig::new("w-test-0")
            .with_backoff_base(0)
            .with_idle_interval(Duration::from_millis(100))
            .with_max_store_failures(20),
    );
    let run = tokio::spawn(async move { worker.run_once().await });

    wait_for_state(store.as_ref(), "c1", JobState::Processing, Duration::from_secs(2)).await;
    let mut holder = other.pool().acquire().await.unwrap();
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *holder)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    sqlx::query("ROLLBACK").execute(&mut *holder).await.unwrap();
    drop(holder);

    let tick = run.await.unwrap().unwrap();
    assert!(matches!(
        tick,
        Tick::Processed(JobOutcome::Retrying { attempts: 1, .. })
    ));
    let job = store.get("c1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
}

#[test_log::test(tokio::test)]
async fn test_timeout_counts_as_exception() {
    let (_dir, store) = create_test_store().await;
    store
        .add(NewJob::new("slow", "sleep 5").with_max_retries(0))
        .await
        .unwrap();

    let worker = JobWorker::new(
        store.clone(),
        fast_worker("w-test-0").with_job_timeout(Some(Duration::from_millis(200))),
    );
    let tick = worker.run_once().await.unwrap();
    assert!(matches!(tick, Tick::Processed(JobOutcome::Dead { attempts: 1, .. })));

    let job = store.get("slow").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert!(job.last_error.unwrap().starts_with("exception:"));
}

#[test_log::test(tokio::test)]
async fn test_idle_worker_stops_within_one_interval() {
    let (_dir, store) = create_test_store().await;
    let worker = JobWorker::new(
        store.clone(),
        WorkerConfig::new("w-test-0").with_idle_interval(Duration::from_secs(1)),
    );
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(store.counts_by_state().await.unwrap().total(), 0);
}

#[test_log::test(tokio::test)]
async fn test_dlq_retry_makes_job_runnable_again() {
    let (_dir, store) = create_test_store().await;
    store
        .add(NewJob::new("d1", "exit 7").with_max_retries(0))
        .await
        .unwrap();

    let worker = JobWorker::new(store.clone(), fast_worker("w-test-0"));
    worker.run_once().await.unwrap();
    assert_eq!(store.list(Some(JobState::Dead)).await.unwrap().len(), 1);

    store.retry_dead("d1").await.unwrap();
    let tick = worker.run_once().await.unwrap();
    assert!(matches!(tick, Tick::Processed(JobOutcome::Dead { attempts: 1, .. })));
}

// ============================================
// Supervisor
// ============================================

#[test_log::test(tokio::test)]
async fn test_supervisor_drains_queue_and_stops_on_request() {
    let (dir, store) = create_test_store().await;
    for i in 0..12 {
        store
            .add(NewJob::new(format!("job-{i}"), format!("echo {i}")))
            .await
            .unwrap();
    }

    let registry_path = dir.path().join("workers");
    let config = SupervisorConfig::new(4)
        .with_worker(fast_worker("template"))
        .with_stop_poll_interval(Duration::from_millis(25))
        .with_registry_path(&registry_path);
    let supervisor = Supervisor::start(store.clone(), config).await.unwrap();

    let registered = WorkerRegistry::new(&registry_path).read().await.unwrap();
    assert_eq!(registered.len(), 4);

    tokio::time::timeout(Duration::from_secs(15), async {
        while store.counts_by_state().await.unwrap().completed < 12 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("queue was not drained");

    request_stop(store.as_ref()).await.unwrap();
    let report = tokio::time::timeout(
        Duration::from_secs(5),
        supervisor.run_until(std::future::pending()),
    )
    .await
    .expect("supervisor did not stop");

    assert_eq!(report.reason, StopReason::StopRequested);
    assert_eq!(report.stopped.len(), 4);
    assert!(report.is_clean());
    assert!(!registry_path.exists());
    assert!(store
        .get_config(keys::STOP_REQUESTED)
        .await
        .unwrap()
        .is_some());
}

#[test_log::test(tokio::test)]
async fn test_shutdown_waits_for_running_job() {
    let (_dir, store) = create_test_store().await;
    store.add(NewJob::new("busy", "sleep 1")).await.unwrap();

    let supervisor = Supervisor::start(
        store.clone(),
        SupervisorConfig::new(1).with_worker(fast_worker("template")),
    )
    .await
    .unwrap();
    wait_for_state(store.as_ref(), "busy", JobState::Processing, Duration::from_secs(5)).await;

    let report = supervisor.shutdown().await;
    assert!(report.is_clean());
    assert_eq!(
        store.get("busy").await.unwrap().unwrap().state,
        JobState::Completed
    );
}

#[test_log::test(tokio::test)]
async fn test_shutdown_grace_period_is_bounded() {
    let (_dir, store) = create_test_store().await;
    store.add(NewJob::new("long", "sleep 10")).await.unwrap();

    let supervisor = Supervisor::start(
        store.clone(),
        SupervisorConfig::new(1)
            .with_worker(fast_worker("template"))
            .with_shutdown_timeout(Duration::from_millis(200)),
    )
    .await
    .unwrap();
    wait_for_state(store.as_ref(), "long", JobState::Processing, Duration::from_secs(5)).await;

    let started = std::time::Instant::now();
    let report = supervisor.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.timed_out.len(), 1);
    assert!(!report.is_clean());
}
