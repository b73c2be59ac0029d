//! SQLite `JobStore`. SQLite serializes all writers against one database
//! file, so there is no `SKIP LOCKED` primitive to reach for — the
//! reservation primitive here is the conditional-update form the contract
//! allows: `UPDATE ... WHERE id IN (SELECT ... LIMIT n) RETURNING *`,
//! relying on SQLite's single-writer guarantee rather than row locks.
//! The connection pool is capped at one connection so this guarantee
//! holds even when the pool is shared by multiple async tasks.
//!
//! Payload/tags/retry-history are stored as TEXT (JSON-encoded) rather
//! than a native JSON type, and timestamps as RFC3339 TEXT via chrono's
//! sqlx binding — SQLite has no native temporal or JSON column type.

use crate::row::{backoff_to_str, DeadLetterRow};
use crate::schema;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jobforge_core::config::{DriverFactory, QueueConfig};
use jobforge_core::error::JobforgeError;
use jobforge_core::job::{
    BackoffStrategy, DeadLetterRecord, Job, JobId, JobSpec, JobStatus, LogEntry, QueueStats,
    RetryHistoryEntry,
};
use jobforge_core::retry;
use jobforge_core::store::JobStore;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::warn;

fn storage_err(err: sqlx::Error) -> JobforgeError {
    JobforgeError::Storage(err.to_string())
}

fn decode_err(err: serde_json::Error) -> JobforgeError {
    JobforgeError::Decode(err.to_string())
}

fn placeholders(count: usize) -> String {
    std::iter::repeat("?").take(count).collect::<Vec<_>>().join(",")
}

/// Reads the columns needed to quarantine a row whose payload/tags fail to
/// decode, without going through the payload decode itself.
fn row_identity(row: &SqliteRow) -> Result<(i64, String, String, i16, i32), JobforgeError> {
    Ok((
        row.try_get("id").map_err(storage_err)?,
        row.try_get("queue").map_err(storage_err)?,
        row.try_get("task").map_err(storage_err)?,
        row.try_get("priority").map_err(storage_err)?,
        row.try_get("attempts").map_err(storage_err)?,
    ))
}

fn row_to_job(row: &SqliteRow) -> Result<Job, JobforgeError> {
    let tags_text: Option<String> = row.try_get("tags").map_err(storage_err)?;
    let payload_text: String = row.try_get("payload").map_err(storage_err)?;
    let backoff_strategy: String = row.try_get("backoff_strategy").map_err(storage_err)?;
    let tags = tags_text.map(|text| serde_json::from_str::<Vec<String>>(&text)).transpose().map_err(decode_err)?;

    Ok(Job {
        id: JobId(row.try_get("id").map_err(storage_err)?),
        queue: row.try_get("queue").map_err(storage_err)?,
        priority: row.try_get("priority").map_err(storage_err)?,
        task: row.try_get("task").map_err(storage_err)?,
        payload: serde_json::from_str(&payload_text).map_err(decode_err)?,
        status: JobStatus::Reserved,
        attempts: row.try_get("attempts").map_err(storage_err)?,
        max_attempts: row.try_get("max_attempts").map_err(storage_err)?,
        retry_delay: row.try_get("retry_delay").map_err(storage_err)?,
        backoff_strategy: BackoffStrategy::parse(&backoff_strategy),
        created_at: row.try_get("created_at").map_err(storage_err)?,
        updated_at: row.try_get("updated_at").map_err(storage_err)?,
        available_at: row.try_get("available_at").map_err(storage_err)?,
        reserved_at: row.try_get("reserved_at").map_err(storage_err)?,
        last_error: row.try_get("last_error").map_err(storage_err)?,
        timeout: row.try_get("timeout").map_err(storage_err)?,
        tags,
    })
}

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens a pooled connection pinned to one connection (SQLite's
    /// single-writer model means more than one buys nothing but
    /// `SQLITE_BUSY` retries) with `busy_timeout` set to absorb brief
    /// writer contention instead of failing outright.
    pub async fn connect(url: &str) -> Result<Self, JobforgeError> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect(url).await.map_err(storage_err)?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await.map_err(storage_err)?;
        sqlx::query("PRAGMA foreign_keys = ON;").execute(&pool).await.map_err(storage_err)?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), JobforgeError> {
        for stmt in schema::statements(schema::SQLITE_SCHEMA) {
            sqlx::query(stmt).execute(&self.pool).await.map_err(storage_err)?;
        }
        Ok(())
    }

    /// Moves a row whose payload/tags failed to decode straight to
    /// `failed_jobs` instead of letting one bad row block the rest of a
    /// `reserve` batch. Runs over the plain pool, so only valid outside an
    /// open transaction on the same (single) connection.
    async fn quarantine_undecodable(
        &self,
        id: i64,
        queue: &str,
        task: &str,
        priority: i16,
        attempts: i32,
        error: &str,
    ) -> Result<(), JobforgeError> {
        quarantine_undecodable_row(&self.pool, id, queue, task, priority, attempts, error).await?;
        sqlx::query("DELETE FROM jobs WHERE id = ?").bind(id).execute(&self.pool).await.map_err(storage_err)?;
        Ok(())
    }
}

/// Inserts the `failed_jobs` row for a payload that couldn't be decoded.
/// Generic over the executor so it can run against the plain pool (from
/// `reserve`) or against an open transaction (from `reclaim_expired_leases`,
/// which already holds the pool's one connection).
async fn quarantine_undecodable_row<'e, E>(
    executor: E,
    id: i64,
    queue: &str,
    task: &str,
    priority: i16,
    attempts: i32,
    error: &str,
) -> Result<(), JobforgeError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let now = Utc::now();
    let message = format!("payload failed to decode: {error}");
    let payload_text = serde_json::json!({ "decode_error": error }).to_string();
    let history_text = serde_json::to_string(&vec![RetryHistoryEntry {
        attempt: attempts,
        error: jobforge_core::job::truncate_error(&message),
        at: now,
    }])
    .map_err(decode_err)?;

    sqlx::query(
        r#"
        INSERT INTO failed_jobs
            (id, queue, task, payload, exception, stack_trace, failed_at,
             total_attempts, retry_history, original_job_id, priority, tags)
        VALUES (?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(id)
    .bind(queue)
    .bind(task)
    .bind(payload_text)
    .bind(jobforge_core::job::truncate_error(&message))
    .bind(now)
    .bind(attempts)
    .bind(history_text)
    .bind(id)
    .bind(priority)
    .execute(executor)
    .await
    .map_err(storage_err)?;
    Ok(())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, spec: JobSpec) -> Result<JobId, JobforgeError> {
        let now = Utc::now();
        let available_at = now + spec.delay;
        let tags_text = spec.tags.as_ref().map(|tags| serde_json::to_string(tags)).transpose().map_err(decode_err)?;
        let payload_text = serde_json::to_string(&spec.payload).map_err(decode_err)?;

        let row = sqlx::query(
            r#"
            INSERT INTO jobs
                (queue, priority, task, payload, attempts, max_attempts, retry_delay,
                 backoff_strategy, created_at, updated_at, available_at, timeout, tags)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&spec.queue)
        .bind(spec.priority)
        .bind(&spec.task)
        .bind(payload_text)
        .bind(spec.max_attempts)
        .bind(spec.retry_delay)
        .bind(backoff_to_str(spec.backoff_strategy))
        .bind(now)
        .bind(now)
        .bind(available_at)
        .bind(spec.timeout)
        .bind(tags_text)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(JobId(row.try_get("id").map_err(storage_err)?))
    }

    async fn reserve(&self, queues: &[String], batch_size: i64) -> Result<Vec<Job>, JobforgeError> {
        let now = Utc::now();

        let select_sql = if queues.is_empty() {
            "SELECT id FROM jobs WHERE reserved_at IS NULL AND available_at <= ? \
             ORDER BY priority ASC, available_at ASC, id ASC LIMIT ?"
                .to_string()
        } else {
            format!(
                "SELECT id FROM jobs WHERE reserved_at IS NULL AND available_at <= ? AND queue IN ({}) \
                 ORDER BY priority ASC, available_at ASC, id ASC LIMIT ?",
                placeholders(queues.len())
            )
        };
        let update_sql = format!(
            "UPDATE jobs SET reserved_at = ?, attempts = attempts + 1, updated_at = ? \
             WHERE id IN ({select_sql}) RETURNING *"
        );

        let mut query = sqlx::query(&update_sql).bind(now).bind(now).bind(now);
        for queue in queues {
            query = query.bind(queue);
        }
        let rows = query.bind(batch_size).fetch_all(&self.pool).await.map_err(storage_err)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_job(row) {
                Ok(job) => jobs.push(job),
                Err(JobforgeError::Decode(message)) => {
                    let (id, queue, task, priority, attempts) = row_identity(row)?;
                    warn!(job_id = id, queue = %queue, task = %task, error = %message, "payload failed to decode, quarantining to dead letter");
                    self.quarantine_undecodable(id, &queue, &task, priority, attempts, &message).await?;
                }
                Err(other) => return Err(other),
            }
        }
        jobs.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.available_at.cmp(&b.available_at)).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn complete(&self, id: JobId) -> Result<(), JobforgeError> {
        sqlx::query("DELETE FROM jobs WHERE id = ? AND reserved_at IS NOT NULL")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn fail_retry(&self, id: JobId, error: &str, next_available_at: DateTime<Utc>) -> Result<(), JobforgeError> {
        sqlx::query("UPDATE jobs SET reserved_at = NULL, available_at = ?, last_error = ?, updated_at = ? WHERE id = ?")
            .bind(next_available_at)
            .bind(jobforge_core::job::truncate_error(error))
            .bind(Utc::now())
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn fail_terminal(&self, id: JobId, error: &str, stack_trace: Option<&str>) -> Result<(), JobforgeError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let Some(row) = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
        else {
            return Ok(());
        };
        let job = row_to_job(&row)?;
        let now = Utc::now();
        let payload_text = serde_json::to_string(&job.payload).map_err(decode_err)?;
        let tags_text = job.tags.as_ref().map(|tags| serde_json::to_string(tags)).transpose().map_err(decode_err)?;
        let history_text = serde_json::to_string(&vec![RetryHistoryEntry {
            attempt: job.attempts,
            error: error.to_string(),
            at: now,
        }])
        .map_err(decode_err)?;

        sqlx::query(
            r#"
            INSERT INTO failed_jobs
                (id, queue, task, payload, exception, stack_trace, failed_at,
                 total_attempts, retry_history, original_job_id, priority, tags)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.queue)
        .bind(&job.task)
        .bind(payload_text)
        .bind(jobforge_core::job::truncate_error(error))
        .bind(stack_trace)
        .bind(now)
        .bind(job.attempts)
        .bind(history_text)
        .bind(job.id.0)
        .bind(job.priority)
        .bind(tags_text)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query("DELETE FROM jobs WHERE id = ?").bind(id.0).execute(&mut *tx).await.map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn release(&self, id: JobId, available_at: DateTime<Utc>) -> Result<(), JobforgeError> {
        sqlx::query("UPDATE jobs SET reserved_at = NULL, available_at = ?, updated_at = ? WHERE id = ?")
            .bind(available_at)
            .bind(Utc::now())
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn reclaim_expired_leases(&self, grace: ChronoDuration) -> Result<u64, JobforgeError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE reserved_at IS NOT NULL \
             AND datetime(reserved_at, '+' || timeout || ' seconds', '+' || ? || ' seconds') < ?",
        )
        .bind(grace.num_seconds())
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage_err)?;

        let mut reclaimed = 0u64;
        for row in rows {
            let job = match row_to_job(&row) {
                Ok(job) => job,
                Err(JobforgeError::Decode(message)) => {
                    let (id, queue, task, priority, attempts) = row_identity(&row)?;
                    warn!(job_id = id, queue = %queue, task = %task, error = %message, "payload failed to decode on lease reclaim, quarantining to dead letter");
                    quarantine_undecodable_row(&mut *tx, id, &queue, &task, priority, attempts, &message).await?;
                    sqlx::query("DELETE FROM jobs WHERE id = ?").bind(id).execute(&mut *tx).await.map_err(storage_err)?;
                    reclaimed += 1;
                    continue;
                }
                Err(other) => return Err(other),
            };
            if job.attempts < job.max_attempts {
                let delay = retry::jittered_delay_secs(job.backoff_strategy, job.retry_delay.max(0) as u64, job.attempts as u32);
                let next_available_at = now + ChronoDuration::seconds(delay as i64);
                sqlx::query(
                    "UPDATE jobs SET reserved_at = NULL, available_at = ?, last_error = 'lease expired', updated_at = ? WHERE id = ?",
                )
                .bind(next_available_at)
                .bind(now)
                .bind(job.id.0)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            } else {
                let payload_text = serde_json::to_string(&job.payload).map_err(decode_err)?;
                let tags_text = job.tags.as_ref().map(|tags| serde_json::to_string(tags)).transpose().map_err(decode_err)?;
                let history_text = serde_json::to_string(&vec![RetryHistoryEntry {
                    attempt: job.attempts,
                    error: "lease expired".to_string(),
                    at: now,
                }])
                .map_err(decode_err)?;
                sqlx::query(
                    r#"
                    INSERT INTO failed_jobs
                        (id, queue, task, payload, exception, stack_trace, failed_at,
                         total_attempts, retry_history, original_job_id, priority, tags)
                    VALUES (?, ?, ?, ?, 'lease expired', NULL, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(job.id.0)
                .bind(&job.queue)
                .bind(&job.task)
                .bind(payload_text)
                .bind(now)
                .bind(job.attempts)
                .bind(history_text)
                .bind(job.id.0)
                .bind(job.priority)
                .bind(tags_text)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
                sqlx::query("DELETE FROM jobs WHERE id = ?").bind(job.id.0).execute(&mut *tx).await.map_err(storage_err)?;
            }
            reclaimed += 1;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(reclaimed)
    }

    async fn purge_old(&self, age: ChronoDuration) -> Result<u64, JobforgeError> {
        let threshold = Utc::now() - age;
        let result = sqlx::query("DELETE FROM job_logs WHERE created_at < ?")
            .bind(threshold)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn get_failed(&self, limit: i64, offset: i64) -> Result<Vec<DeadLetterRecord>, JobforgeError> {
        let rows = sqlx::query("SELECT * FROM failed_jobs ORDER BY failed_at DESC LIMIT ? OFFSET ?")
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(DeadLetterRow::from_sqlite).collect()
    }

    async fn get_failed_one(&self, id: JobId) -> Result<Option<DeadLetterRecord>, JobforgeError> {
        let row = sqlx::query("SELECT * FROM failed_jobs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(DeadLetterRow::from_sqlite).transpose()
    }

    async fn retry_failed(&self, id: JobId) -> Result<Option<JobId>, JobforgeError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let Some(row) = sqlx::query("SELECT * FROM failed_jobs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
        else {
            return Ok(None);
        };
        let record = DeadLetterRow::from_sqlite(&row)?;
        let now = Utc::now();
        let payload_text = serde_json::to_string(&record.payload).map_err(decode_err)?;
        let tags_text = record.tags.as_ref().map(|tags| serde_json::to_string(tags)).transpose().map_err(decode_err)?;

        let inserted = sqlx::query(
            "INSERT INTO jobs (queue, priority, task, payload, attempts, created_at, updated_at, available_at, tags) \
             VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&record.queue)
        .bind(record.priority)
        .bind(&record.task)
        .bind(payload_text)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(tags_text)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_err)?;
        sqlx::query("DELETE FROM failed_jobs WHERE id = ?").bind(id.0).execute(&mut *tx).await.map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(Some(JobId(inserted.try_get("id").map_err(storage_err)?)))
    }

    async fn retry_all_failed(&self, queue: Option<&str>) -> Result<u64, JobforgeError> {
        let ids: Vec<i64> = match queue {
            Some(queue) => sqlx::query_scalar("SELECT id FROM failed_jobs WHERE queue = ?")
                .bind(queue)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?,
            None => sqlx::query_scalar("SELECT id FROM failed_jobs").fetch_all(&self.pool).await.map_err(storage_err)?,
        };
        let mut count = 0u64;
        for id in ids {
            if self.retry_failed(JobId(id)).await?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_failed(&self, queue: Option<&str>) -> Result<u64, JobforgeError> {
        let result = match queue {
            Some(queue) => sqlx::query("DELETE FROM failed_jobs WHERE queue = ?").bind(queue).execute(&self.pool).await,
            None => sqlx::query("DELETE FROM failed_jobs").execute(&self.pool).await,
        }
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, JobforgeError> {
        let now = Utc::now();
        let row = match queue {
            Some(queue) => sqlx::query(
                "SELECT \
                    SUM(CASE WHEN reserved_at IS NULL AND available_at <= ? THEN 1 ELSE 0 END) AS pending_now, \
                    SUM(CASE WHEN reserved_at IS NULL AND available_at > ? THEN 1 ELSE 0 END) AS pending_later, \
                    SUM(CASE WHEN reserved_at IS NOT NULL THEN 1 ELSE 0 END) AS reserved \
                 FROM jobs WHERE queue = ?",
            )
            .bind(now)
            .bind(now)
            .bind(queue)
            .fetch_one(&self.pool)
            .await,
            None => sqlx::query(
                "SELECT \
                    SUM(CASE WHEN reserved_at IS NULL AND available_at <= ? THEN 1 ELSE 0 END) AS pending_now, \
                    SUM(CASE WHEN reserved_at IS NULL AND available_at > ? THEN 1 ELSE 0 END) AS pending_later, \
                    SUM(CASE WHEN reserved_at IS NOT NULL THEN 1 ELSE 0 END) AS reserved \
                 FROM jobs",
            )
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await,
        }
        .map_err(storage_err)?;

        let dead_letter: i64 = match queue {
            Some(queue) => sqlx::query_scalar("SELECT COUNT(*) FROM failed_jobs WHERE queue = ?")
                .bind(queue)
                .fetch_one(&self.pool)
                .await
                .map_err(storage_err)?,
            None => sqlx::query_scalar("SELECT COUNT(*) FROM failed_jobs").fetch_one(&self.pool).await.map_err(storage_err)?,
        };

        Ok(QueueStats {
            pending_now: row.try_get::<Option<i64>, _>("pending_now").map_err(storage_err)?.unwrap_or(0),
            pending_later: row.try_get::<Option<i64>, _>("pending_later").map_err(storage_err)?.unwrap_or(0),
            reserved: row.try_get::<Option<i64>, _>("reserved").map_err(storage_err)?.unwrap_or(0),
            dead_letter,
        })
    }

    async fn log(&self, entry: LogEntry) -> Result<(), JobforgeError> {
        let context_text = serde_json::to_string(&entry.context).map_err(decode_err)?;
        sqlx::query(
            "INSERT INTO job_logs (job_id, queue, level, message, context, created_at, memory_bytes, execution_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.job_id.0)
        .bind(&entry.queue)
        .bind(format!("{:?}", entry.level).to_lowercase())
        .bind(&entry.message)
        .bind(context_text)
        .bind(entry.created_at)
        .bind(entry.memory_bytes.map(|value| value as i64))
        .bind(entry.execution_ms.map(|value| value as i64))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

pub struct SqliteDriverFactory;

#[async_trait]
impl DriverFactory for SqliteDriverFactory {
    async fn build(&self, config: &QueueConfig) -> Result<Arc<dyn JobStore>, JobforgeError> {
        let url = config
            .connection_url
            .as_deref()
            .ok_or_else(|| JobforgeError::Config("sqlite driver requires connection_url".to_string()))?;
        let store = SqliteJobStore::connect(url).await?;
        store.migrate().await?;
        Ok(Arc::new(store))
    }
}
