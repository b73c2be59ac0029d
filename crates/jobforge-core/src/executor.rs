//! Runs one reserved job under a timeout, times it, and settles it via the
//! store. Outcomes are modeled as an explicit tagged value rather than
//! exceptions: settlement is a match, never a caught panic used for
//! control flow — though a handler that genuinely panics is still caught
//! at this boundary and converted into a normal `Retry`/`Terminal` outcome
//! so one bad handler can't take the worker process down.

use crate::clock::Clock;
use crate::error::JobforgeError;
use crate::job::{truncate_error, Job};
use crate::resolver::JobResolver;
use crate::retry;
use crate::store::JobStore;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Result of a single execution attempt, as handed to the settlement step.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed,
    Retry { error: String },
    Terminal { error: String, stack_trace: Option<String> },
}

pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    resolver: Arc<dyn JobResolver>,
    clock: Arc<dyn Clock>,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn JobStore>, resolver: Arc<dyn JobResolver>, clock: Arc<dyn Clock>) -> Self {
        Self { store, resolver, clock }
    }

    /// Executes `job`, settling it in the store before returning. Errors
    /// returned here are store/driver faults, not handler failures —
    /// handler failures are always translated into an `Outcome` and a
    /// successful settlement call.
    pub async fn execute(&self, job: &Job) -> Result<Outcome, JobforgeError> {
        let handler = match self.resolver.resolve(&job.task).await {
            Ok(handler) => handler,
            Err(resolution_err) => {
                let message = resolution_err.to_string();
                self.store
                    .fail_terminal(job.id, &message, None)
                    .await?;
                error!(job_id = %job.id, queue = %job.queue, task = %job.task, error = %message, "job resolution failed, moved to dead letter");
                return Ok(Outcome::Terminal { error: message, stack_trace: None });
            }
        };

        let started = Instant::now();
        let deadline = Duration::from_secs(job.timeout.max(0) as u64);
        let payload = job.payload.clone();
        let attempt_future = AssertUnwindSafe(handler.handle(payload)).catch_unwind();

        let outcome = match tokio::time::timeout(deadline, attempt_future).await {
            Err(_elapsed) => {
                self.settle_failure(job, "handler timed out before deadline".to_string()).await?
            }
            Ok(Err(_panic)) => {
                self.settle_failure(job, "handler panicked".to_string()).await?
            }
            Ok(Ok(Err(handler_error))) => self.settle_failure(job, handler_error).await?,
            Ok(Ok(Ok(()))) => {
                self.store.complete(job.id).await?;
                info!(
                    job_id = %job.id,
                    queue = %job.queue,
                    task = %job.task,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
                Outcome::Completed
            }
        };

        Ok(outcome)
    }

    async fn settle_failure(&self, job: &Job, error: String) -> Result<Outcome, JobforgeError> {
        let truncated = truncate_error(&error);
        if job.attempts < job.max_attempts {
            let delay = retry::jittered_delay_secs(
                job.backoff_strategy,
                job.retry_delay.max(0) as u64,
                job.attempts as u32,
            );
            let next_available_at = self.clock.now() + chrono::Duration::seconds(delay as i64);
            self.store.fail_retry(job.id, &truncated, next_available_at).await?;
            warn!(
                job_id = %job.id,
                queue = %job.queue,
                task = %job.task,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                retry_in_secs = delay,
                error = %truncated,
                "job failed, scheduled for retry"
            );
            Ok(Outcome::Retry { error: truncated })
        } else {
            self.store.fail_terminal(job.id, &truncated, None).await?;
            error!(
                job_id = %job.id,
                queue = %job.queue,
                task = %job.task,
                attempts = job.attempts,
                error = %truncated,
                "job exhausted retries, moved to dead letter"
            );
            Ok(Outcome::Terminal { error: truncated, stack_trace: None })
        }
    }

    /// Fast path used when queueing is disabled: resolve, invoke, return
    /// success/failure. Never retried, never persisted.
    pub async fn execute_sync(&self, task: &str, payload: serde_json::Value) -> bool {
        match self.resolver.resolve(task).await {
            Ok(handler) => match handler.handle(payload).await {
                Ok(()) => true,
                Err(error) => {
                    error!(task = %task, error = %error, "synchronous task failed");
                    false
                }
            },
            Err(resolution_err) => {
                error!(task = %task, error = %resolution_err, "synchronous task resolution failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::{BackoffStrategy, JobSpec};
    use crate::memory::{JobDefaults, MemoryJobStore};
    use crate::resolver::{CommandRegistry, JobHandler};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    fn clock_at(secs: i64) -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.timestamp_opt(secs, 0).unwrap()))
    }

    fn spec(task: &str, max_attempts: i32, timeout: i64) -> JobSpec {
        JobSpec {
            queue: "default".to_string(),
            priority: 5,
            task: task.to_string(),
            payload: serde_json::json!({}),
            max_attempts,
            retry_delay: 1,
            backoff_strategy: BackoffStrategy::Fixed,
            timeout,
            tags: None,
            delay: chrono::Duration::zero(),
        }
    }

    struct Ok1;
    #[async_trait]
    impl JobHandler for Ok1 {
        async fn handle(&self, _payload: serde_json::Value) -> Result<(), String> {
            Ok(())
        }
    }

    struct Fails;
    #[async_trait]
    impl JobHandler for Fails {
        async fn handle(&self, _payload: serde_json::Value) -> Result<(), String> {
            Err("handler blew up".to_string())
        }
    }

    struct Slow;
    #[async_trait]
    impl JobHandler for Slow {
        async fn handle(&self, _payload: serde_json::Value) -> Result<(), String> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(())
        }
    }

    struct Panics;
    #[async_trait]
    impl JobHandler for Panics {
        async fn handle(&self, _payload: serde_json::Value) -> Result<(), String> {
            panic!("handler panicked on purpose");
        }
    }

    #[tokio::test]
    async fn completed_handler_deletes_the_row() {
        let clock = clock_at(1_000);
        let store: Arc<dyn crate::store::JobStore> = Arc::new(MemoryJobStore::new(clock.clone(), JobDefaults::default()));
        let resolver = Arc::new(CommandRegistry::new());
        resolver.register("ok", || Ok1);
        let executor = JobExecutor::new(store.clone(), resolver, clock.clone());

        let id = store.insert(spec("ok", 3, 30)).await.unwrap();
        let job = store.reserve(&[], 1).await.unwrap().remove(0);

        let outcome = executor.execute(&job).await.unwrap();
        assert!(matches!(outcome, Outcome::Completed));
        assert!(store.get_failed_one(id).await.unwrap().is_none());
        let stats = store.stats(None).await.unwrap();
        assert_eq!(stats.pending_now + stats.pending_later + stats.reserved, 0);
    }

    #[tokio::test]
    async fn handler_error_below_max_attempts_retries() {
        let clock = clock_at(1_000);
        let store: Arc<dyn crate::store::JobStore> = Arc::new(MemoryJobStore::new(clock.clone(), JobDefaults::default()));
        let resolver = Arc::new(CommandRegistry::new());
        resolver.register("fails", || Fails);
        let executor = JobExecutor::new(store.clone(), resolver, clock.clone());

        store.insert(spec("fails", 3, 30)).await.unwrap();
        let job = store.reserve(&[], 1).await.unwrap().remove(0);
        assert_eq!(job.attempts, 1);

        let outcome = executor.execute(&job).await.unwrap();
        assert!(matches!(outcome, Outcome::Retry { .. }));

        // job is back in pending, not dead-lettered
        let stats = store.stats(None).await.unwrap();
        assert_eq!(stats.dead_letter, 0);
        assert_eq!(stats.pending_now + stats.pending_later, 1);
    }

    #[tokio::test]
    async fn handler_error_at_max_attempts_dead_letters() {
        let clock = clock_at(1_000);
        let store: Arc<dyn crate::store::JobStore> = Arc::new(MemoryJobStore::new(clock.clone(), JobDefaults::default()));
        let resolver = Arc::new(CommandRegistry::new());
        resolver.register("fails", || Fails);
        let executor = JobExecutor::new(store.clone(), resolver, clock.clone());

        let id = store.insert(spec("fails", 1, 30)).await.unwrap();
        let job = store.reserve(&[], 1).await.unwrap().remove(0);
        assert_eq!(job.attempts, 1);

        let outcome = executor.execute(&job).await.unwrap();
        assert!(matches!(outcome, Outcome::Terminal { .. }));
        assert!(store.get_failed_one(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn timeout_elapses_into_terminal_when_attempts_exhausted() {
        let clock = clock_at(1_000);
        let store: Arc<dyn crate::store::JobStore> = Arc::new(MemoryJobStore::new(clock.clone(), JobDefaults::default()));
        let resolver = Arc::new(CommandRegistry::new());
        resolver.register("slow", || Slow);
        let executor = JobExecutor::new(store.clone(), resolver, clock.clone());

        store.insert(spec("slow", 1, 0)).await.unwrap();
        let job = store.reserve(&[], 1).await.unwrap().remove(0);

        let outcome = executor.execute(&job).await.unwrap();
        assert!(matches!(outcome, Outcome::Terminal { ref error, .. } if error.contains("timed out")));
    }

    #[tokio::test]
    async fn panicking_handler_is_caught_not_propagated() {
        let clock = clock_at(1_000);
        let store: Arc<dyn crate::store::JobStore> = Arc::new(MemoryJobStore::new(clock.clone(), JobDefaults::default()));
        let resolver = Arc::new(CommandRegistry::new());
        resolver.register("panics", || Panics);
        let executor = JobExecutor::new(store.clone(), resolver, clock.clone());

        store.insert(spec("panics", 1, 30)).await.unwrap();
        let job = store.reserve(&[], 1).await.unwrap().remove(0);

        let outcome = executor.execute(&job).await.unwrap();
        assert!(matches!(outcome, Outcome::Terminal { ref error, .. } if error.contains("panicked")));
    }

    #[tokio::test]
    async fn unknown_task_is_terminal_without_invoking_a_handler() {
        let clock = clock_at(1_000);
        let store: Arc<dyn crate::store::JobStore> = Arc::new(MemoryJobStore::new(clock.clone(), JobDefaults::default()));
        let resolver = Arc::new(CommandRegistry::new());
        let executor = JobExecutor::new(store.clone(), resolver, clock.clone());

        let id = store.insert(spec("ghost", 5, 30)).await.unwrap();
        let job = store.reserve(&[], 1).await.unwrap().remove(0);

        let outcome = executor.execute(&job).await.unwrap();
        assert!(matches!(outcome, Outcome::Terminal { .. }));
        assert!(store.get_failed_one(id).await.unwrap().is_some());
    }
}
