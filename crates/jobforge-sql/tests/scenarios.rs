//! End-to-end scenarios against the SQLite driver, run with an in-memory
//! database — no external service required. Postgres/MySQL share the same
//! `JobStore` contract and are expected to pass the same scenarios against
//! a live database (exercised separately, gated behind a configured
//! connection and `#[ignore]`).

#![cfg(feature = "sqlite")]

use chrono::Duration as ChronoDuration;
use jobforge_core::{BackoffStrategy, JobSpec, JobStore};
use jobforge_sql::SqliteJobStore;

async fn fresh_store() -> SqliteJobStore {
    let store = SqliteJobStore::connect("sqlite::memory:").await.unwrap();
    store.migrate().await.unwrap();
    store
}

fn spec(task: &str, priority: i16) -> JobSpec {
    JobSpec {
        queue: "default".to_string(),
        priority,
        task: task.to_string(),
        payload: serde_json::json!({}),
        max_attempts: 3,
        retry_delay: 10,
        backoff_strategy: BackoffStrategy::Exponential,
        timeout: 30,
        tags: None,
        delay: ChronoDuration::zero(),
    }
}

/// Lower priority value is served first; ties break FIFO by id.
#[tokio::test]
async fn priority_then_fifo_ordering() {
    let store = fresh_store().await;
    store.insert(spec("A", 5)).await.unwrap();
    store.insert(spec("B", 1)).await.unwrap();
    store.insert(spec("C", 5)).await.unwrap();

    let reserved = store.reserve(&[], 10).await.unwrap();
    let order: Vec<&str> = reserved.iter().map(|job| job.task.as_str()).collect();
    assert_eq!(order, vec!["B", "A", "C"]);
}

/// A delayed job is invisible to `reserve` until its `available_at` has
/// passed.
#[tokio::test]
async fn delayed_job_is_not_reservable_until_available_at() {
    let store = fresh_store().await;
    let mut delayed = spec("D", 5);
    delayed.delay = ChronoDuration::seconds(2);
    store.insert(delayed).await.unwrap();

    assert!(store.reserve(&[], 10).await.unwrap().is_empty());
    tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
    assert_eq!(store.reserve(&[], 10).await.unwrap().len(), 1);
}

/// Three failures exhaust `max_attempts`, landing the job in `failed_jobs`
/// with no surviving `jobs` row.
#[tokio::test]
async fn retry_exhausts_into_dead_letter() {
    let store = fresh_store().await;
    let mut job_spec = spec("E", 5);
    job_spec.max_attempts = 3;
    job_spec.retry_delay = 0;
    let id = store.insert(job_spec).await.unwrap();

    for _ in 0..3 {
        let reserved = store.reserve(&[], 10).await.unwrap();
        assert_eq!(reserved.len(), 1);
        let job = &reserved[0];
        if job.attempts < job.max_attempts {
            store.fail_retry(job.id, "boom", chrono::Utc::now()).await.unwrap();
        } else {
            store.fail_terminal(job.id, "boom", None).await.unwrap();
        }
    }

    let dead_letter = store.get_failed_one(id).await.unwrap().unwrap();
    assert_eq!(dead_letter.total_attempts, 3);
    assert!(store.stats(None).await.unwrap().reserved == 0);
}

/// A reserved job whose lease has expired is returned to `pending` with
/// `attempts` preserved and `last_error = "lease expired"`, then
/// reservable again with `attempts` incremented once more.
#[tokio::test]
async fn expired_lease_is_reclaimed_and_reservable_again() {
    let store = fresh_store().await;
    let mut job_spec = spec("F", 5);
    job_spec.timeout = 0;
    store.insert(job_spec).await.unwrap();

    let reserved = store.reserve(&[], 10).await.unwrap();
    assert_eq!(reserved[0].attempts, 1);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let reclaimed = store.reclaim_expired_leases(ChronoDuration::zero()).await.unwrap();
    assert_eq!(reclaimed, 1);

    let again = store.reserve(&[], 10).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].attempts, 2);
    assert_eq!(again[0].last_error.as_deref(), Some("lease expired"));
}

/// `retry_failed` inserts a new pending row with `attempts = 0` and
/// removes the dead-letter row atomically.
#[tokio::test]
async fn dead_letter_retry_round_trip() {
    let store = fresh_store().await;
    let id = store.insert(spec("G", 5)).await.unwrap();
    store.reserve(&[], 10).await.unwrap();
    store.fail_terminal(id, "kaboom", None).await.unwrap();

    let new_id = store.retry_failed(id).await.unwrap().unwrap();
    assert!(store.get_failed_one(id).await.unwrap().is_none());

    let reserved = store.reserve(&[], 10).await.unwrap();
    assert_eq!(reserved[0].id, new_id);
    assert_eq!(reserved[0].attempts, 1);
}

/// Completing or terminally failing an already-absent row is a no-op,
/// never an error.
#[tokio::test]
async fn idempotent_settlement_on_absent_row() {
    let store = fresh_store().await;
    let id = store.insert(spec("H", 5)).await.unwrap();
    store.reserve(&[], 10).await.unwrap();
    store.complete(id).await.unwrap();

    assert!(store.complete(id).await.is_ok());
    assert!(store.fail_terminal(id, "already gone", None).await.is_ok());
}

/// Two concurrent `reserve` calls against one pending row never both
/// return it.
#[tokio::test]
async fn concurrent_reserve_never_double_claims() {
    let store = std::sync::Arc::new(fresh_store().await);
    store.insert(spec("only", 5)).await.unwrap();

    let a = { let store = store.clone(); tokio::spawn(async move { store.reserve(&[], 10).await.unwrap() }) };
    let b = { let store = store.clone(); tokio::spawn(async move { store.reserve(&[], 10).await.unwrap() }) };

    let (first, second) = tokio::join!(a, b);
    let total = first.unwrap().len() + second.unwrap().len();
    assert_eq!(total, 1);
}
