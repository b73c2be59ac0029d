//! Order confirmation emailer — shows how to use `jobforge-core` directly
//! in a small host: one handler, one `CommandRegistry`, the in-memory
//! store for a self-contained demo, and a few worker cycles against it.
//! No adapters, no ceremony.

use async_trait::async_trait;
use jobforge_core::{
    BackoffStrategy, CommandRegistry, JobDefaults, JobExecutor, JobHandler, JobforgeError,
    MemoryJobStore, QueueConfig, QueueManager, SystemClock,
};
use std::sync::Arc;

struct SendOrderEmail;

#[async_trait]
impl JobHandler for SendOrderEmail {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), String> {
        let order_id = payload.get("order_id").and_then(|v| v.as_str()).ok_or("missing order_id")?;
        let to = payload.get("to").and_then(|v| v.as_str()).ok_or("missing to")?;

        if to.is_empty() {
            return Err("recipient address is empty".to_string());
        }

        tracing::info!(order_id, to, "sent order confirmation email");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), JobforgeError> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = QueueConfig { enabled: true, ..QueueConfig::default() };
    let clock = Arc::new(SystemClock);
    let store = Arc::new(MemoryJobStore::new(clock.clone(), JobDefaults::default()));

    let resolver = Arc::new(CommandRegistry::new());
    resolver.register("send_order_email", || SendOrderEmail);

    let executor = Arc::new(JobExecutor::new(store.clone(), resolver, clock.clone()));
    let manager = QueueManager::new(config, store, executor, clock);

    for (order_id, to) in [("A-1001", "alice@example.com"), ("A-1002", ""), ("A-1003", "carol@example.com")] {
        manager
            .on("send_order_email")
            .priority(3)
            .max_attempts(2)
            .backoff(BackoffStrategy::Linear)
            .retry_after(0)
            .dispatch(serde_json::json!({ "order_id": order_id, "to": to }))
            .await?;
    }

    // Three orders queued, one has a bad address and will retry then
    // dead-letter. Run enough cycles to drain the queue.
    for _ in 0..6 {
        manager.process(&[]).await?;
    }

    let stats = manager.stats(None).await?;
    tracing::info!(?stats, "queue drained");

    for record in manager.get_failed_jobs(10, 0).await? {
        tracing::warn!(order = %record.payload, error = %record.exception, "order email permanently failed");
    }

    Ok(())
}
