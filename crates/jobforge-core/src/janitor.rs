//! Periodic maintenance: lease reclaim, old-row purge, dead-letter purge.
//! Every duty here is idempotent and safe to run concurrently with
//! workers — each acts through the same transactional store operations
//! workers use, never bypassing them.

use crate::dispatch::QueueManager;
use crate::error::JobforgeError;
use std::sync::Arc;
use tracing::info;

pub struct Janitor {
    manager: Arc<QueueManager>,
}

impl Janitor {
    pub fn new(manager: Arc<QueueManager>) -> Self {
        Self { manager }
    }

    /// Reclaims leases whose `reserved_at + timeout + grace` has elapsed.
    /// Meant to run every worker cycle or on a short interval timer.
    pub async fn reclaim_expired_leases(&self) -> Result<u64, JobforgeError> {
        let reclaimed = self.manager.reclaim_expired_leases().await?;
        if reclaimed > 0 {
            info!(reclaimed, "janitor reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    /// Purges old `failed_jobs`/`job_logs` rows. Meant for a slow schedule
    /// (daily cron), not every cycle.
    pub async fn purge_old(&self) -> Result<u64, JobforgeError> {
        let purged = self.manager.purge_old_jobs().await?;
        if purged > 0 {
            info!(purged, "janitor purged old rows");
        }
        Ok(purged)
    }

    /// Operator-invoked purge of dead-letter rows, optionally scoped to a
    /// single queue.
    pub async fn purge_failed(&self, queue: Option<&str>) -> Result<u64, JobforgeError> {
        let purged = self.manager.purge_failed_jobs(queue).await?;
        info!(purged, queue = queue.unwrap_or("*"), "janitor purged failed jobs");
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QueueConfig;
    use crate::executor::JobExecutor;
    use crate::job::{BackoffStrategy, JobSpec};
    use crate::memory::{JobDefaults, MemoryJobStore};
    use crate::resolver::{CommandRegistry, JobHandler};
    use crate::store::JobStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    struct NeverReturns;
    #[async_trait]
    impl JobHandler for NeverReturns {
        async fn handle(&self, _payload: serde_json::Value) -> Result<(), String> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn spec(task: &str, timeout: i64) -> JobSpec {
        JobSpec {
            queue: "default".to_string(),
            priority: 5,
            task: task.to_string(),
            payload: serde_json::json!({}),
            max_attempts: 3,
            retry_delay: 10,
            backoff_strategy: BackoffStrategy::Fixed,
            timeout,
            tags: None,
            delay: ChronoDuration::zero(),
        }
    }

    #[tokio::test]
    async fn reclaim_expired_leases_picks_up_stale_reservations() {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_000, 0).unwrap()));
        let store = Arc::new(MemoryJobStore::new(clock.clone(), JobDefaults::default()));
        let resolver = Arc::new(CommandRegistry::new());
        resolver.register("stuck", || NeverReturns);
        let executor = Arc::new(JobExecutor::new(store.clone() as Arc<dyn JobStore>, resolver, clock.clone()));
        let config = QueueConfig { enabled: true, lease_grace_seconds: 5, ..QueueConfig::default() };
        let manager = Arc::new(QueueManager::new(config, store.clone() as Arc<dyn JobStore>, executor, clock.clone()));
        let janitor = Janitor::new(manager.clone());

        store.insert(spec("stuck", 10)).await.unwrap();
        store.reserve(&[], 1).await.unwrap();

        // nothing expired yet
        assert_eq!(janitor.reclaim_expired_leases().await.unwrap(), 0);

        clock.advance(ChronoDuration::seconds(20));
        assert_eq!(janitor.reclaim_expired_leases().await.unwrap(), 1);

        let stats = manager.stats(None).await.unwrap();
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.pending_now + stats.pending_later, 1);
    }

    #[tokio::test]
    async fn purge_failed_removes_dead_letter_rows() {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_000, 0).unwrap()));
        let store = Arc::new(MemoryJobStore::new(clock.clone(), JobDefaults::default()));
        let resolver = Arc::new(CommandRegistry::new());
        let executor = Arc::new(JobExecutor::new(store.clone() as Arc<dyn JobStore>, resolver, clock.clone()));
        let config = QueueConfig { enabled: true, ..QueueConfig::default() };
        let manager = Arc::new(QueueManager::new(config, store.clone() as Arc<dyn JobStore>, executor, clock.clone()));
        let janitor = Janitor::new(manager.clone());

        let id = store.insert(spec("ghost", 30)).await.unwrap();
        store.reserve(&[], 1).await.unwrap();
        store.fail_terminal(id, "no handler", None).await.unwrap();

        let purged = janitor.purge_failed(None).await.unwrap();
        assert_eq!(purged, 1);
        assert!(manager.get_failed_job(id).await.unwrap().is_none());
    }
}
