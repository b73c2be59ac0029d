//! PostgreSQL `JobStore`. Reservation uses `FOR UPDATE SKIP LOCKED` inside
//! a CTE plus `UPDATE ... RETURNING` so concurrent reservers never block on
//! each other and never double-claim a row.

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
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::warn;

fn storage_err(err: sqlx::Error) -> JobforgeError {
    JobforgeError::Storage(err.to_string())
}

/// Reads the columns needed to quarantine a row whose payload/tags fail to
/// decode, without going through the payload decode itself.
fn row_identity(row: &PgRow) -> Result<(i64, String, String, i16, i32), JobforgeError> {
    Ok((
        row.try_get("id").map_err(storage_err)?,
        row.try_get("queue").map_err(storage_err)?,
        row.try_get("task").map_err(storage_err)?,
        row.try_get("priority").map_err(storage_err)?,
        row.try_get("attempts").map_err(storage_err)?,
    ))
}

fn row_to_job(row: &PgRow) -> Result<Job, JobforgeError> {
    let tags: Option<Json<Vec<String>>> = row.try_get("tags").map_err(storage_err)?;
    let backoff_strategy: String = row.try_get("backoff_strategy").map_err(storage_err)?;
    let payload: Json<serde_json::Value> = row.try_get("payload").map_err(storage_err)?;
    Ok(Job {
        id: JobId(row.try_get("id").map_err(storage_err)?),
        queue: row.try_get("queue").map_err(storage_err)?,
        priority: row.try_get("priority").map_err(storage_err)?,
        task: row.try_get("task").map_err(storage_err)?,
        payload: payload.0,
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
        tags: tags.map(|json| json.0),
    })
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), JobforgeError> {
        for stmt in schema::statements(schema::POSTGRES_SCHEMA) {
            sqlx::query(stmt).execute(&self.pool).await.map_err(storage_err)?;
        }
        Ok(())
    }

    async fn load_dead_letter(&self, row: PgRow) -> Result<DeadLetterRecord, JobforgeError> {
        DeadLetterRow::from_pg(&row)
    }

    /// Moves a row whose payload/tags failed to decode straight to
    /// `failed_jobs` instead of letting one bad row block the rest of a
    /// `reserve` batch.
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
        sqlx::query("DELETE FROM jobs WHERE id = $1").bind(id).execute(&self.pool).await.map_err(storage_err)?;
        Ok(())
    }
}

/// Inserts the `failed_jobs` row for a payload that couldn't be decoded.
/// Generic over the executor so it can run against the plain pool (from
/// `reserve`) or against an open transaction (from `reclaim_expired_leases`).
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
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let now = Utc::now();
    let message = format!("payload failed to decode: {error}");
    let payload = serde_json::json!({ "decode_error": error });
    sqlx::query(
        r#"
        INSERT INTO failed_jobs
            (id, queue, task, payload, exception, stack_trace, failed_at,
             total_attempts, retry_history, original_job_id, priority, tags)
        VALUES ($1, $2, $3, $4, $5, NULL, now(), $6, $7, $1, $8, NULL)
        "#,
    )
    .bind(id)
    .bind(queue)
    .bind(task)
    .bind(Json(payload))
    .bind(jobforge_core::job::truncate_error(&message))
    .bind(attempts)
    .bind(Json(vec![RetryHistoryEntry {
        attempt: attempts,
        error: jobforge_core::job::truncate_error(&message),
        at: now,
    }]))
    .bind(priority)
    .execute(executor)
    .await
    .map_err(storage_err)?;
    Ok(())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, spec: JobSpec) -> Result<JobId, JobforgeError> {
        let now = Utc::now();
        let available_at = now + spec.delay;
        let row = sqlx::query(
            r#"
            INSERT INTO jobs
                (queue, priority, task, payload, attempts, max_attempts, retry_delay,
                 backoff_strategy, created_at, updated_at, available_at, timeout, tags)
            VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $8, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(&spec.queue)
        .bind(spec.priority)
        .bind(&spec.task)
        .bind(Json(&spec.payload))
        .bind(spec.max_attempts)
        .bind(spec.retry_delay)
        .bind(backoff_to_str(spec.backoff_strategy))
        .bind(now)
        .bind(available_at)
        .bind(spec.timeout)
        .bind(spec.tags.as_ref().map(Json))
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(JobId(row.try_get("id").map_err(storage_err)?))
    }

    async fn reserve(&self, queues: &[String], batch_size: i64) -> Result<Vec<Job>, JobforgeError> {
        let now = Utc::now();
        let queue_filter: Option<Vec<String>> = if queues.is_empty() { None } else { Some(queues.to_vec()) };

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id FROM jobs
                WHERE reserved_at IS NULL
                  AND available_at <= $1
                  AND ($2::text[] IS NULL OR queue = ANY($2::text[]))
                ORDER BY priority ASC, available_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET reserved_at = $1, attempts = attempts + 1, updated_at = $1
            FROM claimable
            WHERE jobs.id = claimable.id
            RETURNING jobs.id, jobs.queue, jobs.priority, jobs.task, jobs.payload,
                      jobs.attempts, jobs.max_attempts, jobs.retry_delay, jobs.backoff_strategy,
                      jobs.created_at, jobs.updated_at, jobs.available_at, jobs.reserved_at,
                      jobs.last_error, jobs.timeout, jobs.tags
            "#,
        )
        .bind(now)
        .bind(queue_filter)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

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
        Ok(jobs)
    }

    async fn complete(&self, id: JobId) -> Result<(), JobforgeError> {
        sqlx::query("DELETE FROM jobs WHERE id = $1 AND reserved_at IS NOT NULL")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn fail_retry(
        &self,
        id: JobId,
        error: &str,
        next_available_at: DateTime<Utc>,
    ) -> Result<(), JobforgeError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET reserved_at = NULL, available_at = $1, last_error = $2, updated_at = now()
            WHERE id = $3
            "#,
        )
        .bind(next_available_at)
        .bind(jobforge_core::job::truncate_error(error))
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn fail_terminal(
        &self,
        id: JobId,
        error: &str,
        stack_trace: Option<&str>,
    ) -> Result<(), JobforgeError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let Some(row) = sqlx::query("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
        else {
            return Ok(());
        };
        let job = row_to_job(&row)?;

        sqlx::query(
            r#"
            INSERT INTO failed_jobs
                (id, queue, task, payload, exception, stack_trace, failed_at,
                 total_attempts, retry_history, original_job_id, priority, tags)
            VALUES ($1, $2, $3, $4, $5, $6, now(), $7, $8, $1, $9, $10)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.queue)
        .bind(&job.task)
        .bind(Json(&job.payload))
        .bind(jobforge_core::job::truncate_error(error))
        .bind(stack_trace)
        .bind(job.attempts)
        .bind(Json(vec![RetryHistoryEntry {
            attempt: job.attempts,
            error: error.to_string(),
            at: Utc::now(),
        }]))
        .bind(job.priority)
        .bind(job.tags.as_ref().map(Json))
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query("DELETE FROM jobs WHERE id = $1").bind(id.0).execute(&mut *tx).await.map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn release(&self, id: JobId, available_at: DateTime<Utc>) -> Result<(), JobforgeError> {
        sqlx::query("UPDATE jobs SET reserved_at = NULL, available_at = $1, updated_at = now() WHERE id = $2")
            .bind(available_at)
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
            r#"
            SELECT * FROM jobs
            WHERE reserved_at IS NOT NULL
              AND reserved_at + (timeout || ' seconds')::interval + ($1 || ' seconds')::interval < $2
            FOR UPDATE SKIP LOCKED
            "#,
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
                    sqlx::query("DELETE FROM jobs WHERE id = $1").bind(id).execute(&mut *tx).await.map_err(storage_err)?;
                    reclaimed += 1;
                    continue;
                }
                Err(other) => return Err(other),
            };
            if job.attempts < job.max_attempts {
                let delay = retry::jittered_delay_secs(job.backoff_strategy, job.retry_delay.max(0) as u64, job.attempts as u32);
                let next_available_at = now + ChronoDuration::seconds(delay as i64);
                sqlx::query(
                    "UPDATE jobs SET reserved_at = NULL, available_at = $1, last_error = 'lease expired', updated_at = $2 WHERE id = $3",
                )
                .bind(next_available_at)
                .bind(now)
                .bind(job.id.0)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            } else {
                sqlx::query(
                    r#"
                    INSERT INTO failed_jobs
                        (id, queue, task, payload, exception, stack_trace, failed_at,
                         total_attempts, retry_history, original_job_id, priority, tags)
                    VALUES ($1, $2, $3, $4, 'lease expired', NULL, $5, $6, $7, $1, $8, $9)
                    "#,
                )
                .bind(job.id.0)
                .bind(&job.queue)
                .bind(&job.task)
                .bind(Json(&job.payload))
                .bind(now)
                .bind(job.attempts)
                .bind(Json(vec![RetryHistoryEntry { attempt: job.attempts, error: "lease expired".to_string(), at: now }]))
                .bind(job.priority)
                .bind(job.tags.as_ref().map(Json))
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
                sqlx::query("DELETE FROM jobs WHERE id = $1").bind(job.id.0).execute(&mut *tx).await.map_err(storage_err)?;
            }
            reclaimed += 1;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(reclaimed)
    }

    async fn purge_old(&self, age: ChronoDuration) -> Result<u64, JobforgeError> {
        let threshold = Utc::now() - age;
        let result = sqlx::query("DELETE FROM job_logs WHERE created_at < $1")
            .bind(threshold)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn get_failed(&self, limit: i64, offset: i64) -> Result<Vec<DeadLetterRecord>, JobforgeError> {
        let rows = sqlx::query("SELECT * FROM failed_jobs ORDER BY failed_at DESC LIMIT $1 OFFSET $2")
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(self.load_dead_letter(row).await?);
        }
        Ok(records)
    }

    async fn get_failed_one(&self, id: JobId) -> Result<Option<DeadLetterRecord>, JobforgeError> {
        let row = sqlx::query("SELECT * FROM failed_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        match row {
            Some(row) => Ok(Some(self.load_dead_letter(row).await?)),
            None => Ok(None),
        }
    }

    async fn retry_failed(&self, id: JobId) -> Result<Option<JobId>, JobforgeError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let Some(row) = sqlx::query("SELECT * FROM failed_jobs WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
        else {
            return Ok(None);
        };
        let record = DeadLetterRow::from_pg(&row)?;
        let now = Utc::now();
        let new_row = sqlx::query(
            r#"
            INSERT INTO jobs (queue, priority, task, payload, attempts, created_at, updated_at, available_at, tags)
            VALUES ($1, $2, $3, $4, 0, $5, $5, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&record.queue)
        .bind(record.priority)
        .bind(&record.task)
        .bind(Json(&record.payload))
        .bind(now)
        .bind(record.tags.as_ref().map(Json))
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_err)?;
        sqlx::query("DELETE FROM failed_jobs WHERE id = $1").bind(id.0).execute(&mut *tx).await.map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(Some(JobId(new_row.try_get("id").map_err(storage_err)?)))
    }

    async fn retry_all_failed(&self, queue: Option<&str>) -> Result<u64, JobforgeError> {
        let ids: Vec<i64> = match queue {
            Some(queue) => sqlx::query_scalar("SELECT id FROM failed_jobs WHERE queue = $1")
                .bind(queue)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?,
            None => sqlx::query_scalar("SELECT id FROM failed_jobs")
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?,
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
            Some(queue) => sqlx::query("DELETE FROM failed_jobs WHERE queue = $1").bind(queue).execute(&self.pool).await,
            None => sqlx::query("DELETE FROM failed_jobs").execute(&self.pool).await,
        }
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, JobforgeError> {
        let row = match queue {
            Some(queue) => sqlx::query(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE reserved_at IS NULL AND available_at <= now()) AS pending_now,
                    COUNT(*) FILTER (WHERE reserved_at IS NULL AND available_at > now()) AS pending_later,
                    COUNT(*) FILTER (WHERE reserved_at IS NOT NULL) AS reserved
                FROM jobs WHERE queue = $1
                "#,
            )
            .bind(queue)
            .fetch_one(&self.pool)
            .await,
            None => sqlx::query(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE reserved_at IS NULL AND available_at <= now()) AS pending_now,
                    COUNT(*) FILTER (WHERE reserved_at IS NULL AND available_at > now()) AS pending_later,
                    COUNT(*) FILTER (WHERE reserved_at IS NOT NULL) AS reserved
                FROM jobs
                "#,
            )
            .fetch_one(&self.pool)
            .await,
        }
        .map_err(storage_err)?;

        let dead_letter: i64 = match queue {
            Some(queue) => sqlx::query_scalar("SELECT COUNT(*) FROM failed_jobs WHERE queue = $1")
                .bind(queue)
                .fetch_one(&self.pool)
                .await
                .map_err(storage_err)?,
            None => sqlx::query_scalar("SELECT COUNT(*) FROM failed_jobs")
                .fetch_one(&self.pool)
                .await
                .map_err(storage_err)?,
        };

        Ok(QueueStats {
            pending_now: row.try_get("pending_now").map_err(storage_err)?,
            pending_later: row.try_get("pending_later").map_err(storage_err)?,
            reserved: row.try_get("reserved").map_err(storage_err)?,
            dead_letter,
        })
    }

    async fn log(&self, entry: LogEntry) -> Result<(), JobforgeError> {
        sqlx::query(
            r#"
            INSERT INTO job_logs (job_id, queue, level, message, context, created_at, memory_bytes, execution_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.job_id.0)
        .bind(&entry.queue)
        .bind(format!("{:?}", entry.level).to_lowercase())
        .bind(&entry.message)
        .bind(Json(&entry.context))
        .bind(entry.created_at)
        .bind(entry.memory_bytes.map(|value| value as i64))
        .bind(entry.execution_ms.map(|value| value as i64))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

/// Connects a pool and applies migrations, per [`DriverFactory`].
pub struct PostgresDriverFactory;

#[async_trait]
impl DriverFactory for PostgresDriverFactory {
    async fn build(&self, config: &QueueConfig) -> Result<Arc<dyn JobStore>, JobforgeError> {
        let url = config
            .connection_url
            .as_deref()
            .ok_or_else(|| JobforgeError::Config("pgsql driver requires connection_url".to_string()))?;
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await.map_err(storage_err)?;
        let store = PgJobStore::new(pool);
        store.migrate().await?;
        Ok(Arc::new(store))
    }
}
