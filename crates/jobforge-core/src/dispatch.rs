//! Public enqueue API. `QueueManager` is constructed with its `JobStore` and
//! `JobExecutor` already built — no service locator, no process-global
//! configuration lookup. When `queue.enabled` is false it routes `add`
//! straight through the executor's synchronous path instead of the store.

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::JobforgeError;
use crate::executor::JobExecutor;
use crate::job::{BackoffStrategy, DeadLetterRecord, JobId, JobSpec, QueueStats};
use crate::store::JobStore;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

/// Optional overrides for a single `add` call; unset fields fall back to
/// [`QueueConfig`]'s defaults.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub queue: Option<String>,
    pub priority: Option<i16>,
    pub delay: Option<ChronoDuration>,
    pub max_attempts: Option<i32>,
    pub timeout: Option<i64>,
    pub backoff_strategy: Option<BackoffStrategy>,
    pub retry_delay: Option<i64>,
    pub tags: Option<Vec<String>>,
}

pub struct QueueManager {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    executor: Arc<JobExecutor>,
    clock: Arc<dyn Clock>,
}

impl QueueManager {
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<JobExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, store, executor, clock }
    }

    /// Starts a fluent dispatch for `task`, defaulting every field from
    /// this manager's [`QueueConfig`].
    pub fn on(&self, task: impl Into<String>) -> PendingDispatch<'_> {
        PendingDispatch::new(self, task.into())
    }

    /// Enqueues `task` with `payload`, applying `options` over the
    /// manager's configured defaults. When `queue.enabled` is false, runs
    /// the handler in-process via the executor's sync path instead and
    /// never touches the store.
    pub async fn add(
        &self,
        task: impl Into<String>,
        payload: serde_json::Value,
        options: AddOptions,
    ) -> Result<bool, JobforgeError> {
        let task = task.into();

        if !self.config.enabled {
            return Ok(self.executor.execute_sync(&task, payload).await);
        }

        let spec = JobSpec {
            queue: options.queue.unwrap_or_else(|| self.config.default_queue.clone()),
            priority: options.priority.unwrap_or(self.config.default_priority),
            task,
            payload,
            max_attempts: options.max_attempts.unwrap_or(self.config.default_max_attempts),
            retry_delay: options.retry_delay.unwrap_or(self.config.default_retry_delay_seconds),
            backoff_strategy: options.backoff_strategy.unwrap_or(self.config.default_backoff),
            timeout: options.timeout.unwrap_or(self.config.default_timeout_seconds),
            tags: options.tags,
            delay: options.delay.unwrap_or_else(ChronoDuration::zero),
        };

        self.store.insert(spec).await?;
        Ok(true)
    }

    /// Runs one reserve-execute cycle against at most one job.
    #[instrument(skip(self, queues))]
    pub async fn process(&self, queues: &[String]) -> Result<(), JobforgeError> {
        let reserved = self.store.reserve(queues, 1).await?;
        for job in &reserved {
            self.executor.execute(job).await?;
        }
        Ok(())
    }

    /// Reserves up to `batch_size` jobs and executes them sequentially,
    /// releasing any unexecuted rows back to `pending` if the wall clock
    /// exceeds `max_wall_seconds` before they're reached.
    #[instrument(skip(self, queues))]
    pub async fn process_batch(
        &self,
        batch_size: i64,
        queues: &[String],
        max_wall_seconds: u64,
    ) -> Result<u64, JobforgeError> {
        let reserved = self.store.reserve(queues, batch_size).await?;
        let started = Instant::now();
        let deadline = std::time::Duration::from_secs(max_wall_seconds);
        let mut executed = 0u64;

        for (index, job) in reserved.iter().enumerate() {
            if index > 0 && started.elapsed() >= deadline {
                let now = self.clock.now();
                for remaining in &reserved[index..] {
                    self.store.release(remaining.id, now).await?;
                }
                info!(
                    released = reserved.len() - index,
                    executed,
                    "wall clock ceiling reached, released remaining batch"
                );
                return Ok(executed);
            }
            self.executor.execute(job).await?;
            executed += 1;
        }

        Ok(executed)
    }

    pub async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, JobforgeError> {
        self.store.stats(queue).await
    }

    pub async fn get_failed_jobs(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeadLetterRecord>, JobforgeError> {
        self.store.get_failed(limit, offset).await
    }

    pub async fn get_failed_job(&self, id: JobId) -> Result<Option<DeadLetterRecord>, JobforgeError> {
        self.store.get_failed_one(id).await
    }

    pub async fn retry_failed_job(&self, id: JobId) -> Result<Option<JobId>, JobforgeError> {
        self.store.retry_failed(id).await
    }

    pub async fn retry_all_failed_jobs(&self, queue: Option<&str>) -> Result<u64, JobforgeError> {
        self.store.retry_all_failed(queue).await
    }

    pub async fn purge_old_jobs(&self) -> Result<u64, JobforgeError> {
        let age = ChronoDuration::days(self.config.purge_completed_age_days);
        self.store.purge_old(age).await
    }

    pub async fn purge_failed_jobs(&self, queue: Option<&str>) -> Result<u64, JobforgeError> {
        self.store.purge_failed(queue).await
    }

    pub async fn reclaim_expired_leases(&self) -> Result<u64, JobforgeError> {
        let grace = ChronoDuration::seconds(self.config.lease_grace_seconds);
        self.store.reclaim_expired_leases(grace).await
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

/// Fluent builder over [`QueueManager::add`]. Pure syntactic sugar — every
/// method just sets a field on the eventual [`AddOptions`].
pub struct PendingDispatch<'a> {
    manager: &'a QueueManager,
    task: String,
    options: AddOptions,
}

impl<'a> PendingDispatch<'a> {
    fn new(manager: &'a QueueManager, task: String) -> Self {
        Self { manager, task, options: AddOptions::default() }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.options.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.options.priority = Some(priority);
        self
    }

    pub fn delay(mut self, delay: ChronoDuration) -> Self {
        self.options.delay = Some(delay);
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.options.max_attempts = Some(max_attempts);
        self
    }

    pub fn timeout(mut self, timeout: i64) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.options.backoff_strategy = Some(strategy);
        self
    }

    pub fn retry_after(mut self, seconds: i64) -> Self {
        self.options.retry_delay = Some(seconds);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.options.tags = Some(tags);
        self
    }

    pub async fn dispatch(self, payload: serde_json::Value) -> Result<bool, JobforgeError> {
        self.manager.add(self.task, payload, self.options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::{JobDefaults, MemoryJobStore};
    use crate::resolver::{CommandRegistry, JobHandler};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

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
            Err("nope".to_string())
        }
    }

    fn manager_with(enabled: bool) -> (Arc<QueueManager>, Arc<MemoryJobStore>) {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_000, 0).unwrap()));
        let store = Arc::new(MemoryJobStore::new(clock.clone(), JobDefaults::default()));
        let resolver = Arc::new(CommandRegistry::new());
        resolver.register("ok", || Ok1);
        resolver.register("fails", || Fails);
        let executor = Arc::new(JobExecutor::new(store.clone() as Arc<dyn JobStore>, resolver, clock.clone()));
        let config = QueueConfig { enabled, ..QueueConfig::default() };
        let manager = Arc::new(QueueManager::new(config, store.clone() as Arc<dyn JobStore>, executor, clock));
        (manager, store)
    }

    #[tokio::test]
    async fn disabled_queue_runs_synchronously_and_never_touches_the_store() {
        let (manager, store) = manager_with(false);
        let ok = manager.add("ok", serde_json::json!({}), AddOptions::default()).await.unwrap();
        assert!(ok);
        let stats = store.stats(None).await.unwrap();
        assert_eq!(stats.pending_now + stats.pending_later + stats.reserved, 0);
    }

    #[tokio::test]
    async fn enabled_queue_persists_and_process_drains_it() {
        let (manager, _store) = manager_with(true);
        manager.add("ok", serde_json::json!({}), AddOptions::default()).await.unwrap();

        let before = manager.stats(None).await.unwrap();
        assert_eq!(before.pending_now, 1);

        manager.process(&[]).await.unwrap();

        let after = manager.stats(None).await.unwrap();
        assert_eq!(after.pending_now + after.pending_later + after.reserved, 0);
    }

    #[tokio::test]
    async fn pending_dispatch_builder_applies_overrides() {
        let (manager, store) = manager_with(true);
        manager
            .on("ok")
            .on_queue("priority-mail")
            .priority(1)
            .max_attempts(9)
            .dispatch(serde_json::json!({ "x": 1 }))
            .await
            .unwrap();

        let reserved = store.reserve(&["priority-mail".to_string()], 1).await.unwrap();
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].priority, 1);
        assert_eq!(reserved[0].max_attempts, 9);
    }

    #[tokio::test]
    async fn process_batch_releases_remaining_jobs_past_the_wall_clock_ceiling() {
        let (manager, store) = manager_with(true);
        for _ in 0..3 {
            manager.add("fails", serde_json::json!({}), AddOptions::default()).await.unwrap();
        }

        // max_wall_seconds = 0 means the ceiling is already exceeded before
        // the second job is reached, so only the first job executes.
        let executed = manager.process_batch(10, &[], 0).await.unwrap();
        assert_eq!(executed, 1);

        let stats = store.stats(None).await.unwrap();
        assert_eq!(stats.pending_now, 2);
        assert_eq!(stats.reserved, 0);
    }
}
