//! The `JobStore` driver contract. This is the single source of truth and
//! the single point of synchronization; every mutation below must be
//! transactional in a conforming implementation. See `jobforge-sql` for
//! the three SQL-backed drivers and [`crate::memory::MemoryJobStore`] for
//! the in-process implementation used by sync mode and tests.

use crate::error::JobforgeError;
use crate::job::{DeadLetterRecord, Job, JobId, JobSpec, LogEntry, QueueStats};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a row with `status = pending`, `available_at = now + delay`,
    /// `attempts = 0`. Does not validate that `task` resolves.
    async fn insert(&self, spec: JobSpec) -> Result<JobId, JobforgeError>;

    /// Atomically selects up to `batch_size` due, runnable rows ordered by
    /// `priority ASC, available_at ASC, id ASC`, transitioning each to
    /// `reserved` in the same transaction. `queues` empty means any queue.
    /// The contract: at most one caller ever observes a given `(id,
    /// attempts)` pair returned from `reserve`.
    async fn reserve(&self, queues: &[String], batch_size: i64) -> Result<Vec<Job>, JobforgeError>;

    /// Requires the row to be `reserved`. Deletes it. Idempotent when the
    /// row is already absent.
    async fn complete(&self, id: JobId) -> Result<(), JobforgeError>;

    /// Requires the row to be `reserved`. Returns it to `pending` with
    /// `available_at = next_available_at`; does not touch `attempts`.
    async fn fail_retry(
        &self,
        id: JobId,
        error: &str,
        next_available_at: DateTime<Utc>,
    ) -> Result<(), JobforgeError>;

    /// Requires the row to be `reserved`. Copies it into `failed_jobs`
    /// (`total_attempts = attempts`, error appended to `retry_history`)
    /// then deletes the `jobs` row, in one transaction.
    async fn fail_terminal(
        &self,
        id: JobId,
        error: &str,
        stack_trace: Option<&str>,
    ) -> Result<(), JobforgeError>;

    /// Returns a currently-reserved-but-unexecuted row to `pending` with
    /// `available_at = now`, without recording an error. Used by
    /// `processBatch`'s wall-clock ceiling to release rows it chose not to
    /// execute this cycle.
    async fn release(&self, id: JobId, available_at: DateTime<Utc>) -> Result<(), JobforgeError>;

    /// Finds rows whose lease (`reserved_at + timeout + grace`) has
    /// expired and either retries them (if `attempts < max_attempts`) or
    /// moves them to dead-letter with error `"lease expired"`. Returns the
    /// number of rows reclaimed.
    async fn reclaim_expired_leases(&self, grace: ChronoDuration) -> Result<u64, JobforgeError>;

    /// Deletes `job_logs` rows older than `age`. (`jobs` never retains
    /// completed/failed rows to age out; see DESIGN.md for that decision.)
    async fn purge_old(&self, age: ChronoDuration) -> Result<u64, JobforgeError>;

    async fn get_failed(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeadLetterRecord>, JobforgeError>;

    async fn get_failed_one(&self, id: JobId) -> Result<Option<DeadLetterRecord>, JobforgeError>;

    /// Inserts a **new** `jobs` row from the dead-letter record (same
    /// queue/task/payload/priority/tags, `attempts = 0`) and deletes the
    /// dead-letter row, atomically. Returns the new job's id, or `None` if
    /// the dead-letter record did not exist.
    async fn retry_failed(&self, id: JobId) -> Result<Option<JobId>, JobforgeError>;

    async fn retry_all_failed(&self, queue: Option<&str>) -> Result<u64, JobforgeError>;

    async fn purge_failed(&self, queue: Option<&str>) -> Result<u64, JobforgeError>;

    /// Cheap, non-locking aggregate read.
    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, JobforgeError>;

    /// Appends a diagnostic log entry. Never consulted by the hot path;
    /// drivers that don't materialize `job_logs` may no-op.
    async fn log(&self, _entry: LogEntry) -> Result<(), JobforgeError> {
        Ok(())
    }
}
