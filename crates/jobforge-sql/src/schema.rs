//! DDL for the three required tables. Columns and indexes are part of the
//! contract (`jobs`, `failed_jobs`, `job_logs`); only column types and the
//! reservation primitive differ per dialect.

#[cfg(feature = "postgres")]
pub const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id BIGSERIAL PRIMARY KEY,
    queue TEXT NOT NULL DEFAULT 'default',
    priority SMALLINT NOT NULL DEFAULT 5,
    task TEXT NOT NULL,
    payload JSONB NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    retry_delay BIGINT NOT NULL DEFAULT 60,
    backoff_strategy TEXT NOT NULL DEFAULT 'exponential',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    reserved_at TIMESTAMPTZ,
    last_error TEXT,
    timeout BIGINT NOT NULL DEFAULT 300,
    tags JSONB
);
CREATE INDEX IF NOT EXISTS idx_jobs_reserve ON jobs (queue, priority, available_at);
CREATE INDEX IF NOT EXISTS idx_jobs_pending ON jobs (priority, available_at);
CREATE INDEX IF NOT EXISTS idx_jobs_leases ON jobs (reserved_at) WHERE reserved_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs (created_at);

CREATE TABLE IF NOT EXISTS failed_jobs (
    id BIGINT PRIMARY KEY,
    queue TEXT NOT NULL,
    task TEXT NOT NULL,
    payload JSONB NOT NULL,
    exception TEXT NOT NULL,
    stack_trace TEXT,
    failed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    total_attempts INTEGER NOT NULL,
    retry_history JSONB NOT NULL DEFAULT '[]',
    original_job_id BIGINT NOT NULL,
    priority SMALLINT NOT NULL,
    tags JSONB
);
CREATE INDEX IF NOT EXISTS idx_failed_jobs_queue ON failed_jobs (queue, failed_at DESC);
CREATE INDEX IF NOT EXISTS idx_failed_jobs_task ON failed_jobs (task, failed_at DESC);

CREATE TABLE IF NOT EXISTS job_logs (
    id BIGSERIAL PRIMARY KEY,
    job_id BIGINT NOT NULL,
    queue TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    context JSONB NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    memory_bytes BIGINT,
    execution_ms BIGINT
);
CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs (job_id, created_at);
CREATE INDEX IF NOT EXISTS idx_job_logs_level ON job_logs (level, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_job_logs_queue ON job_logs (queue, created_at DESC);
"#;

#[cfg(feature = "mysql")]
pub const MYSQL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id BIGINT AUTO_INCREMENT PRIMARY KEY,
    queue VARCHAR(191) NOT NULL DEFAULT 'default',
    priority SMALLINT NOT NULL DEFAULT 5,
    task VARCHAR(191) NOT NULL,
    payload JSON NOT NULL,
    attempts INT NOT NULL DEFAULT 0,
    max_attempts INT NOT NULL DEFAULT 3,
    retry_delay BIGINT NOT NULL DEFAULT 60,
    backoff_strategy VARCHAR(32) NOT NULL DEFAULT 'exponential',
    created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
    updated_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
    available_at DATETIME(6) NOT NULL,
    reserved_at DATETIME(6) NULL,
    last_error TEXT,
    timeout BIGINT NOT NULL DEFAULT 300,
    tags JSON NULL,
    INDEX idx_jobs_reserve (queue, priority, available_at),
    INDEX idx_jobs_pending (priority, available_at),
    INDEX idx_jobs_leases (reserved_at),
    INDEX idx_jobs_created (created_at)
);

CREATE TABLE IF NOT EXISTS failed_jobs (
    id BIGINT PRIMARY KEY,
    queue VARCHAR(191) NOT NULL,
    task VARCHAR(191) NOT NULL,
    payload JSON NOT NULL,
    exception TEXT NOT NULL,
    stack_trace TEXT,
    failed_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
    total_attempts INT NOT NULL,
    retry_history JSON NOT NULL,
    original_job_id BIGINT NOT NULL,
    priority SMALLINT NOT NULL,
    tags JSON NULL,
    INDEX idx_failed_jobs_queue (queue, failed_at DESC),
    INDEX idx_failed_jobs_task (task, failed_at DESC)
);

CREATE TABLE IF NOT EXISTS job_logs (
    id BIGINT AUTO_INCREMENT PRIMARY KEY,
    job_id BIGINT NOT NULL,
    queue VARCHAR(191) NOT NULL,
    level VARCHAR(16) NOT NULL,
    message TEXT NOT NULL,
    context JSON NOT NULL,
    created_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
    memory_bytes BIGINT NULL,
    execution_ms BIGINT NULL,
    INDEX idx_job_logs_job (job_id, created_at),
    INDEX idx_job_logs_level (level, created_at DESC),
    INDEX idx_job_logs_queue (queue, created_at DESC)
);
"#;

#[cfg(feature = "sqlite")]
pub const SQLITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL DEFAULT 'default',
    priority INTEGER NOT NULL DEFAULT 5,
    task TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    retry_delay INTEGER NOT NULL DEFAULT 60,
    backoff_strategy TEXT NOT NULL DEFAULT 'exponential',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    available_at TEXT NOT NULL,
    reserved_at TEXT,
    last_error TEXT,
    timeout INTEGER NOT NULL DEFAULT 300,
    tags TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_reserve ON jobs (queue, priority, available_at);
CREATE INDEX IF NOT EXISTS idx_jobs_pending ON jobs (priority, available_at);
CREATE INDEX IF NOT EXISTS idx_jobs_leases ON jobs (reserved_at);
CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs (created_at);

CREATE TABLE IF NOT EXISTS failed_jobs (
    id INTEGER PRIMARY KEY,
    queue TEXT NOT NULL,
    task TEXT NOT NULL,
    payload TEXT NOT NULL,
    exception TEXT NOT NULL,
    stack_trace TEXT,
    failed_at TEXT NOT NULL,
    total_attempts INTEGER NOT NULL,
    retry_history TEXT NOT NULL,
    original_job_id INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    tags TEXT
);
CREATE INDEX IF NOT EXISTS idx_failed_jobs_queue ON failed_jobs (queue, failed_at DESC);
CREATE INDEX IF NOT EXISTS idx_failed_jobs_task ON failed_jobs (task, failed_at DESC);

CREATE TABLE IF NOT EXISTS job_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    queue TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    context TEXT NOT NULL,
    created_at TEXT NOT NULL,
    memory_bytes INTEGER,
    execution_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs (job_id, created_at);
CREATE INDEX IF NOT EXISTS idx_job_logs_level ON job_logs (level, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_job_logs_queue ON job_logs (queue, created_at DESC);
"#;

/// Splits a multi-statement DDL block on `;` and drops empty fragments.
/// sqlx's `execute` runs one statement per call on every backend this
/// crate supports, so migrations apply each `CREATE` individually.
pub fn statements(ddl: &str) -> impl Iterator<Item = &str> {
    ddl.split(';').map(str::trim).filter(|stmt| !stmt.is_empty())
}
