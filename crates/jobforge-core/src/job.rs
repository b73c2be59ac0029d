//! The persistent data model: `Job` rows, dead-letter records, and the
//! append-only diagnostic log. See `jobs` / `failed_jobs` / `job_logs` in
//! the storage DDL contract — these types mirror those tables exactly so
//! drivers only need to translate field <-> column, never reinterpret.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque monotonic identifier assigned by the store on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        JobId(value)
    }
}

/// Per-job backoff function. Unrecognized strings fall back to
/// `Exponential` at parse boundaries (see [`BackoffStrategy::parse`]); the
/// strongly-typed enum itself cannot hold an invalid value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

impl BackoffStrategy {
    /// Parses a loosely-typed string (CLI flag, JSON option map) into a
    /// strategy, falling back to `Exponential` for anything unrecognized
    /// per the RetryPolicy contract.
    pub fn parse(value: &str) -> Self {
        match value {
            "linear" => BackoffStrategy::Linear,
            "fixed" => BackoffStrategy::Fixed,
            _ => BackoffStrategy::Exponential,
        }
    }
}

/// Lifecycle status of a `jobs` row. Only `Pending` and `Reserved` are ever
/// actually persisted — `Completed` and `Failed` are transition markers
/// used internally by the executor and by drivers mid-transaction; a
/// completed or terminally-failed job has its row deleted, not relabeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Reserved,
    Completed,
    Failed,
}

/// A `jobs` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub priority: i16,
    pub task: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub retry_delay: i64,
    pub backoff_strategy: BackoffStrategy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub timeout: i64,
    pub tags: Option<Vec<String>>,
}

/// Upper bound on `last_error` / dead-letter `exception` text, per the data
/// model contract.
pub const MAX_ERROR_LEN: usize = 5000;

pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        message.to_string()
    } else {
        let mut truncated = message.chars().take(MAX_ERROR_LEN).collect::<String>();
        truncated.push_str("...(truncated)");
        truncated
    }
}

/// Caller-supplied description of a unit of work, consumed by
/// `JobStore::insert`. Defaults for omitted fields are applied by
/// [`crate::config::QueueConfig`] before reaching the store.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub queue: String,
    pub priority: i16,
    pub task: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub retry_delay: i64,
    pub backoff_strategy: BackoffStrategy,
    pub timeout: i64,
    pub tags: Option<Vec<String>>,
    /// Offset from "now" (as seen by the store's clock) before the row
    /// becomes reservable.
    pub delay: chrono::Duration,
}

/// One entry in a dead-letter record's append-only `retry_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    pub attempt: i32,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// A `failed_jobs` row: the durable record of a terminally failed job,
/// write-only from the engine's perspective and readable by operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: JobId,
    pub queue: String,
    pub task: String,
    pub payload: serde_json::Value,
    pub exception: String,
    pub stack_trace: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub total_attempts: i32,
    pub retry_history: Vec<RetryHistoryEntry>,
    pub original_job_id: JobId,
    pub priority: i16,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A `job_logs` row. Purely operational: never consulted by the reserve/
/// execute/settle hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: JobId,
    pub queue: String,
    pub level: LogLevel,
    pub message: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub memory_bytes: Option<u64>,
    pub execution_ms: Option<u64>,
}

/// Aggregate counts returned by `JobStore::stats`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_now: i64,
    pub pending_later: i64,
    pub reserved: i64,
    pub dead_letter: i64,
}
