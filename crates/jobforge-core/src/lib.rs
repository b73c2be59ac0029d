//! Durable, priority-aware job queue engine: reservation, retry/backoff,
//! and lease recovery layered over a pluggable relational store.
//!
//! This crate defines the engine and the [`JobStore`]/[`DriverFactory`]
//! seams; concrete SQL-backed stores live in `jobforge-sql`, and the
//! `jobforge-cli` binary wires everything together for operators.

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod janitor;
pub mod job;
pub mod memory;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DriverFactory, DriverKind, QueueConfig};
pub use dispatch::{AddOptions, PendingDispatch, QueueManager};
pub use error::{Categorizable, ErrorCategory, JobforgeError};
pub use executor::{JobExecutor, Outcome};
pub use janitor::Janitor;
pub use job::{
    BackoffStrategy, DeadLetterRecord, Job, JobId, JobSpec, JobStatus, LogEntry, LogLevel,
    QueueStats, RetryHistoryEntry,
};
pub use memory::{JobDefaults, MemoryJobStore};
pub use resolver::{CommandRegistry, JobHandler, JobResolver, ResolutionError};
pub use store::JobStore;
pub use worker::{Cancellation, Worker};
