//! MySQL `JobStore`. MySQL 8 supports `FOR UPDATE SKIP LOCKED` but not
//! `UPDATE ... RETURNING`, so reservation is select-ids -> update ->
//! reselect-by-id inside one transaction, rather than the single
//! CTE-plus-RETURNING statement the Postgres driver uses.

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
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::types::Json;
use sqlx::{MySqlPool, Row};
use std::sync::Arc;
use tracing::warn;

fn storage_err(err: sqlx::Error) -> JobforgeError {
    JobforgeError::Storage(err.to_string())
}

/// Builds a `?,?,?`-style placeholder list of `count` entries. Only the
/// *count* is caller-controlled (it's `queues.len()`), never the values —
/// values are always bound separately, never interpolated into the text.
fn placeholders(count: usize) -> String {
    std::iter::repeat("?").take(count).collect::<Vec<_>>().join(",")
}

/// Reads the columns needed to quarantine a row whose payload/tags fail to
/// decode, without going through the payload decode itself.
fn row_identity(row: &MySqlRow) -> Result<(i64, String, String, i16, i32), JobforgeError> {
    Ok((
        row.try_get("id").map_err(storage_err)?,
        row.try_get("queue").map_err(storage_err)?,
        row.try_get("task").map_err(storage_err)?,
        row.try_get("priority").map_err(storage_err)?,
        row.try_get("attempts").map_err(storage_err)?,
    ))
}

fn row_to_job(row: &MySqlRow) -> Result<Job, JobforgeError> {
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

pub struct MysqlJobStore {
    pool: MySqlPool,
}

impl MysqlJobStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), JobforgeError> {
        for stmt in schema::statements(schema::MYSQL_SCHEMA) {
            sqlx::query(stmt).execute(&self.pool).await.map_err(storage_err)?;
        }
        Ok(())
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
        sqlx::query("DELETE FROM jobs WHERE id = ?").bind(id).execute(&self.pool).await.map_err(storage_err)?;
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
    E: sqlx::Executor<'e, Database = sqlx::MySql>,
{
    let now = Utc::now();
    let message = format!("payload failed to decode: {error}");
    let payload = serde_json::json!({ "decode_error": error });
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
    .bind(Json(payload))
    .bind(jobforge_core::job::truncate_error(&message))
    .bind(now)
    .bind(attempts)
    .bind(Json(vec![RetryHistoryEntry {
        attempt: attempts,
        error: jobforge_core::job::truncate_error(&message),
        at: now,
    }]))
    .bind(id)
    .bind(priority)
    .execute(executor)
    .await
    .map_err(storage_err)?;
    Ok(())
}

#[async_trait]
impl JobStore for MysqlJobStore {
    async fn insert(&self, spec: JobSpec) -> Result<JobId, JobforgeError> {
        let now = Utc::now();
        let available_at = now + spec.delay;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs
                (queue, priority, task, payload, attempts, max_attempts, retry_delay,
                 backoff_strategy, created_at, updated_at, available_at, timeout, tags)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?)
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
        .bind(now)
        .bind(available_at)
        .bind(spec.timeout)
        .bind(spec.tags.as_ref().map(Json))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(JobId(result.last_insert_id() as i64))
    }

    async fn reserve(&self, queues: &[String], batch_size: i64) -> Result<Vec<Job>, JobforgeError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let select_sql = if queues.is_empty() {
            "SELECT id FROM jobs WHERE reserved_at IS NULL AND available_at <= ? \
             ORDER BY priority ASC, available_at ASC, id ASC LIMIT ? FOR UPDATE SKIP LOCKED"
                .to_string()
        } else {
            format!(
                "SELECT id FROM jobs WHERE reserved_at IS NULL AND available_at <= ? AND queue IN ({}) \
                 ORDER BY priority ASC, available_at ASC, id ASC LIMIT ? FOR UPDATE SKIP LOCKED",
                placeholders(queues.len())
            )
        };
        let mut select_query = sqlx::query_scalar::<_, i64>(&select_sql).bind(now);
        for queue in queues {
            select_query = select_query.bind(queue);
        }
        let ids: Vec<i64> = select_query.bind(batch_size).fetch_all(&mut *tx).await.map_err(storage_err)?;
        if ids.is_empty() {
            tx.commit().await.map_err(storage_err)?;
            return Ok(Vec::new());
        }

        let update_sql = format!(
            "UPDATE jobs SET reserved_at = ?, attempts = attempts + 1, updated_at = ? WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut update_query = sqlx::query(&update_sql).bind(now).bind(now);
        for id in &ids {
            update_query = update_query.bind(id);
        }
        update_query.execute(&mut *tx).await.map_err(storage_err)?;

        let fetch_sql = format!("SELECT * FROM jobs WHERE id IN ({})", placeholders(ids.len()));
        let mut fetch_query = sqlx::query(&fetch_sql);
        for id in &ids {
            fetch_query = fetch_query.bind(id);
        }
        let rows = fetch_query.fetch_all(&mut *tx).await.map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

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
        let Some(row) = sqlx::query("SELECT * FROM jobs WHERE id = ? FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
        else {
            return Ok(());
        };
        let job = row_to_job(&row)?;
        let now = Utc::now();

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
        .bind(Json(&job.payload))
        .bind(jobforge_core::job::truncate_error(error))
        .bind(stack_trace)
        .bind(now)
        .bind(job.attempts)
        .bind(Json(vec![RetryHistoryEntry { attempt: job.attempts, error: error.to_string(), at: now }]))
        .bind(job.id.0)
        .bind(job.priority)
        .bind(job.tags.as_ref().map(Json))
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
             AND TIMESTAMPADD(SECOND, timeout, TIMESTAMPADD(SECOND, ?, reserved_at)) < ? FOR UPDATE SKIP LOCKED",
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
                sqlx::query("UPDATE jobs SET reserved_at = NULL, available_at = ?, last_error = 'lease expired', updated_at = ? WHERE id = ?")
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
                    VALUES (?, ?, ?, ?, 'lease expired', NULL, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(job.id.0)
                .bind(&job.queue)
                .bind(&job.task)
                .bind(Json(&job.payload))
                .bind(now)
                .bind(job.attempts)
                .bind(Json(vec![RetryHistoryEntry { attempt: job.attempts, error: "lease expired".to_string(), at: now }]))
                .bind(job.id.0)
                .bind(job.priority)
                .bind(job.tags.as_ref().map(Json))
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
        rows.iter().map(DeadLetterRow::from_mysql).collect()
    }

    async fn get_failed_one(&self, id: JobId) -> Result<Option<DeadLetterRecord>, JobforgeError> {
        let row = sqlx::query("SELECT * FROM failed_jobs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(DeadLetterRow::from_mysql).transpose()
    }

    async fn retry_failed(&self, id: JobId) -> Result<Option<JobId>, JobforgeError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let Some(row) = sqlx::query("SELECT * FROM failed_jobs WHERE id = ? FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
        else {
            return Ok(None);
        };
        let record = DeadLetterRow::from_mysql(&row)?;
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO jobs (queue, priority, task, payload, attempts, created_at, updated_at, available_at, tags) \
             VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(&record.queue)
        .bind(record.priority)
        .bind(&record.task)
        .bind(Json(&record.payload))
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(record.tags.as_ref().map(Json))
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        sqlx::query("DELETE FROM failed_jobs WHERE id = ?").bind(id.0).execute(&mut *tx).await.map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(Some(JobId(result.last_insert_id() as i64)))
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
        let (pending_now, pending_later, reserved): (i64, i64, i64) = match queue {
            Some(queue) => sqlx::query_as(
                "SELECT \
                    SUM(CASE WHEN reserved_at IS NULL AND available_at <= NOW() THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN reserved_at IS NULL AND available_at > NOW() THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN reserved_at IS NOT NULL THEN 1 ELSE 0 END) \
                 FROM jobs WHERE queue = ?",
            )
            .bind(queue)
            .fetch_one(&self.pool)
            .await,
            None => sqlx::query_as(
                "SELECT \
                    SUM(CASE WHEN reserved_at IS NULL AND available_at <= NOW() THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN reserved_at IS NULL AND available_at > NOW() THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN reserved_at IS NOT NULL THEN 1 ELSE 0 END) \
                 FROM jobs",
            )
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

        Ok(QueueStats { pending_now, pending_later, reserved, dead_letter })
    }

    async fn log(&self, entry: LogEntry) -> Result<(), JobforgeError> {
        sqlx::query(
            "INSERT INTO job_logs (job_id, queue, level, message, context, created_at, memory_bytes, execution_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
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

pub struct MysqlDriverFactory;

#[async_trait]
impl DriverFactory for MysqlDriverFactory {
    async fn build(&self, config: &QueueConfig) -> Result<Arc<dyn JobStore>, JobforgeError> {
        let url = config
            .connection_url
            .as_deref()
            .ok_or_else(|| JobforgeError::Config("mysql driver requires connection_url".to_string()))?;
        let pool = MySqlPoolOptions::new().max_connections(10).connect(url).await.map_err(storage_err)?;
        let store = MysqlJobStore::new(pool);
        store.migrate().await?;
        Ok(Arc::new(store))
    }
}
