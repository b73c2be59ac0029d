//! Drives reserve -> execute -> settle cycles in a loop. A long-running
//! daemon is the host's responsibility — this type only knows how to run
//! one batch and how to sleep between empty reserves; supervising it
//! (systemd, a tokio task spawned in `main`, a CLI `run` subcommand loop)
//! is left to the caller.

use crate::dispatch::QueueManager;
use crate::error::JobforgeError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Cooperative cancellation flag shared between a host's shutdown signal
/// handler and a running [`Worker`]. Checked only between jobs, never
/// during one — the currently-executing job's own timeout/lease is what
/// bounds it.
#[derive(Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Worker {
    manager: Arc<QueueManager>,
    queues: Vec<String>,
    batch_size: i64,
}

impl Worker {
    pub fn new(manager: Arc<QueueManager>, queues: Vec<String>, batch_size: i64) -> Self {
        Self { manager, queues, batch_size }
    }

    /// Runs one bounded batch and returns the number of jobs executed.
    pub async fn run_once(&self, max_wall_seconds: u64) -> Result<u64, JobforgeError> {
        self.manager.process_batch(self.batch_size, &self.queues, max_wall_seconds).await
    }

    /// Runs batches back to back until `cancellation` is signalled,
    /// sleeping with a capped backoff whenever a batch executes nothing.
    pub async fn run_until_cancelled(
        &self,
        max_wall_seconds: u64,
        cancellation: Cancellation,
    ) -> Result<u64, JobforgeError> {
        let mut total = 0u64;
        let mut backoff = MIN_BACKOFF;

        while !cancellation.is_cancelled() {
            let executed = self.run_once(max_wall_seconds).await?;
            total += executed;

            if executed == 0 {
                debug!(backoff_ms = backoff.as_millis() as u64, "no runnable jobs, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            } else {
                backoff = MIN_BACKOFF;
            }
        }

        info!(total_executed = total, "worker loop cancelled");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QueueConfig;
    use crate::executor::JobExecutor;
    use crate::job::JobSpec;
    use crate::memory::{JobDefaults, MemoryJobStore};
    use crate::resolver::{CommandRegistry, JobHandler};
    use crate::store::JobStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    struct CountingHandler(Arc<AtomicBool>);
    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _payload: serde_json::Value) -> Result<(), String> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn manager_with_one_job() -> Arc<QueueManager> {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_000, 0).unwrap()));
        let store = Arc::new(MemoryJobStore::new(clock.clone(), JobDefaults::default()));
        let resolver = Arc::new(CommandRegistry::new());
        resolver.register("count", || CountingHandler(Arc::new(AtomicBool::new(false))));
        let executor = Arc::new(JobExecutor::new(store.clone() as Arc<dyn JobStore>, resolver, clock.clone()));
        let config = QueueConfig { enabled: true, ..QueueConfig::default() };
        let manager = Arc::new(QueueManager::new(config, store.clone() as Arc<dyn JobStore>, executor, clock.clone()));
        store
            .insert(JobSpec {
                queue: "default".to_string(),
                priority: 5,
                task: "count".to_string(),
                payload: serde_json::json!({}),
                max_attempts: 3,
                retry_delay: 1,
                backoff_strategy: crate::job::BackoffStrategy::Fixed,
                timeout: 30,
                tags: None,
                delay: chrono::Duration::zero(),
            })
            .await
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn run_once_executes_a_runnable_job() {
        let manager = manager_with_one_job().await;
        let worker = Worker::new(manager, vec![], 10);
        let executed = worker.run_once(30).await.unwrap();
        assert_eq!(executed, 1);
    }

    #[tokio::test]
    async fn run_until_cancelled_stops_once_flagged() {
        let manager = manager_with_one_job().await;
        let worker = Worker::new(manager, vec![], 10);
        let cancellation = Cancellation::new();

        let flag = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.cancel();
        });

        let total = worker.run_until_cancelled(30, cancellation.clone()).await.unwrap();
        assert_eq!(total, 1);
        assert!(cancellation.is_cancelled());
    }
}
