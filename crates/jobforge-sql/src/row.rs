//! Shared row-to-domain-type mapping helpers used by every dialect driver.

use jobforge_core::error::JobforgeError;
use jobforge_core::job::{BackoffStrategy, DeadLetterRecord, JobId, RetryHistoryEntry};

pub fn backoff_to_str(strategy: BackoffStrategy) -> &'static str {
    match strategy {
        BackoffStrategy::Exponential => "exponential",
        BackoffStrategy::Linear => "linear",
        BackoffStrategy::Fixed => "fixed",
    }
}

fn storage_err(err: sqlx::Error) -> JobforgeError {
    JobforgeError::Storage(err.to_string())
}

pub struct DeadLetterRow;

#[cfg(feature = "postgres")]
impl DeadLetterRow {
    pub fn from_pg(row: &sqlx::postgres::PgRow) -> Result<DeadLetterRecord, JobforgeError> {
        use sqlx::types::Json;
        use sqlx::Row;
        let tags: Option<Json<Vec<String>>> = row.try_get("tags").map_err(storage_err)?;
        let payload: Json<serde_json::Value> = row.try_get("payload").map_err(storage_err)?;
        let retry_history: Json<Vec<RetryHistoryEntry>> = row.try_get("retry_history").map_err(storage_err)?;
        Ok(DeadLetterRecord {
            id: JobId(row.try_get("id").map_err(storage_err)?),
            queue: row.try_get("queue").map_err(storage_err)?,
            task: row.try_get("task").map_err(storage_err)?,
            payload: payload.0,
            exception: row.try_get("exception").map_err(storage_err)?,
            stack_trace: row.try_get("stack_trace").map_err(storage_err)?,
            failed_at: row.try_get("failed_at").map_err(storage_err)?,
            total_attempts: row.try_get("total_attempts").map_err(storage_err)?,
            retry_history: retry_history.0,
            original_job_id: JobId(row.try_get("original_job_id").map_err(storage_err)?),
            priority: row.try_get("priority").map_err(storage_err)?,
            tags: tags.map(|json| json.0),
        })
    }
}

#[cfg(feature = "mysql")]
impl DeadLetterRow {
    pub fn from_mysql(row: &sqlx::mysql::MySqlRow) -> Result<DeadLetterRecord, JobforgeError> {
        use sqlx::types::Json;
        use sqlx::Row;
        let tags: Option<Json<Vec<String>>> = row.try_get("tags").map_err(storage_err)?;
        let payload: Json<serde_json::Value> = row.try_get("payload").map_err(storage_err)?;
        let retry_history: Json<Vec<RetryHistoryEntry>> = row.try_get("retry_history").map_err(storage_err)?;
        Ok(DeadLetterRecord {
            id: JobId(row.try_get("id").map_err(storage_err)?),
            queue: row.try_get("queue").map_err(storage_err)?,
            task: row.try_get("task").map_err(storage_err)?,
            payload: payload.0,
            exception: row.try_get("exception").map_err(storage_err)?,
            stack_trace: row.try_get("stack_trace").map_err(storage_err)?,
            failed_at: row.try_get("failed_at").map_err(storage_err)?,
            total_attempts: row.try_get("total_attempts").map_err(storage_err)?,
            retry_history: retry_history.0,
            original_job_id: JobId(row.try_get("original_job_id").map_err(storage_err)?),
            priority: row.try_get("priority").map_err(storage_err)?,
            tags: tags.map(|json| json.0),
        })
    }
}

#[cfg(feature = "sqlite")]
impl DeadLetterRow {
    pub fn from_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<DeadLetterRecord, JobforgeError> {
        use sqlx::Row;
        let tags_json: Option<String> = row.try_get("tags").map_err(storage_err)?;
        let payload_text: String = row.try_get("payload").map_err(storage_err)?;
        let retry_history_text: String = row.try_get("retry_history").map_err(storage_err)?;
        let payload: serde_json::Value = serde_json::from_str(&payload_text).map_err(|e| JobforgeError::Decode(e.to_string()))?;
        let retry_history: Vec<RetryHistoryEntry> =
            serde_json::from_str(&retry_history_text).map_err(|e| JobforgeError::Decode(e.to_string()))?;
        let tags = tags_json
            .map(|text| serde_json::from_str::<Vec<String>>(&text))
            .transpose()
            .map_err(|e| JobforgeError::Decode(e.to_string()))?;
        Ok(DeadLetterRecord {
            id: JobId(row.try_get("id").map_err(storage_err)?),
            queue: row.try_get("queue").map_err(storage_err)?,
            task: row.try_get("task").map_err(storage_err)?,
            payload,
            exception: row.try_get("exception").map_err(storage_err)?,
            stack_trace: row.try_get("stack_trace").map_err(storage_err)?,
            failed_at: row.try_get("failed_at").map_err(storage_err)?,
            total_attempts: row.try_get("total_attempts").map_err(storage_err)?,
            retry_history,
            original_job_id: JobId(row.try_get("original_job_id").map_err(storage_err)?),
            priority: row.try_get("priority").map_err(storage_err)?,
            tags,
        })
    }
}
