use crate::{Command, FailedCommand};
use jobforge_core::{
    CommandRegistry, DriverFactory, DriverKind, JobExecutor, JobforgeError, Janitor, QueueConfig,
    QueueManager, SystemClock,
};
use std::sync::Arc;

/// Resolves the configured driver into a concrete [`DriverFactory`]. Only
/// the dialects compiled into this binary (via cargo features) are
/// reachable; requesting an uncompiled dialect is a configuration error.
fn driver_factory(kind: DriverKind) -> Result<Box<dyn DriverFactory>, JobforgeError> {
    match kind {
        DriverKind::Memory | DriverKind::Sync => {
            Err(JobforgeError::Config("memory/sync drivers are constructed in-process, not via a DriverFactory".to_string()))
        }
        #[cfg(feature = "postgres")]
        DriverKind::Pgsql => Ok(Box::new(jobforge_sql::PostgresDriverFactory)),
        #[cfg(not(feature = "postgres"))]
        DriverKind::Pgsql => Err(JobforgeError::Config("binary was not built with the postgres feature".to_string())),
        #[cfg(feature = "mysql")]
        DriverKind::Mysql => Ok(Box::new(jobforge_sql::MysqlDriverFactory)),
        #[cfg(not(feature = "mysql"))]
        DriverKind::Mysql => Err(JobforgeError::Config("binary was not built with the mysql feature".to_string())),
        #[cfg(feature = "sqlite")]
        DriverKind::Sqlite => Ok(Box::new(jobforge_sql::SqliteDriverFactory)),
        #[cfg(not(feature = "sqlite"))]
        DriverKind::Sqlite => Err(JobforgeError::Config("binary was not built with the sqlite feature".to_string())),
    }
}

/// Handlers are registered by the embedding application, not by this
/// binary — a bare `jobforge` CLI has no task code to run. Operators who
/// need to execute real handlers link `jobforge-core` into their own
/// binary and register tasks before constructing the worker; this CLI is
/// the admin/migration/inspection surface, not a task runtime.
fn empty_resolver() -> Arc<CommandRegistry> {
    Arc::new(CommandRegistry::new())
}

pub async fn dispatch(command: Command, config: QueueConfig) -> Result<(), JobforgeError> {
    match command {
        Command::Migrate => {
            let factory = driver_factory(config.driver)?;
            factory.build(&config).await?;
            tracing::info!(driver = ?config.driver, "migrations applied");
            Ok(())
        }
        Command::Run { queue } => {
            let manager = build_manager(&config).await?;
            manager.process(&queue).await?;
            Ok(())
        }
        Command::Batch { size, queue, max_wall_seconds } => {
            let manager = build_manager(&config).await?;
            let executed = manager.process_batch(size, &queue, max_wall_seconds).await?;
            println!("executed {executed} job(s)");
            Ok(())
        }
        Command::Stats { queue } => {
            let manager = build_manager(&config).await?;
            let stats = manager.stats(queue.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&stats).expect("QueueStats serializes"));
            Ok(())
        }
        Command::Failed(failed) => dispatch_failed(failed, &config).await,
    }
}

async fn dispatch_failed(command: FailedCommand, config: &QueueConfig) -> Result<(), JobforgeError> {
    let manager = build_manager(config).await?;
    match command {
        FailedCommand::List { limit, offset } => {
            let records = manager.get_failed_jobs(limit, offset).await?;
            println!("{}", serde_json::to_string_pretty(&records).expect("records serialize"));
        }
        FailedCommand::Retry { id } => {
            let new_id = manager.retry_failed_job(jobforge_core::JobId(id)).await?;
            match new_id {
                Some(new_id) => println!("retried as job {new_id}"),
                None => println!("no dead-letter entry with id {id}"),
            }
        }
        FailedCommand::RetryAll { queue } => {
            let count = manager.retry_all_failed_jobs(queue.as_deref()).await?;
            println!("retried {count} job(s)");
        }
        FailedCommand::Purge { queue } => {
            let janitor = Janitor::new(manager);
            let count = janitor.purge_failed(queue.as_deref()).await?;
            println!("purged {count} job(s)");
        }
    }
    Ok(())
}

async fn build_manager(config: &QueueConfig) -> Result<Arc<QueueManager>, JobforgeError> {
    let clock = Arc::new(SystemClock);
    let store = match config.driver {
        DriverKind::Memory | DriverKind::Sync => {
            Arc::new(jobforge_core::MemoryJobStore::new(clock.clone(), jobforge_core::JobDefaults::default()))
                as Arc<dyn jobforge_core::JobStore>
        }
        _ => driver_factory(config.driver)?.build(config).await?,
    };
    let resolver = empty_resolver();
    let executor = Arc::new(JobExecutor::new(store.clone(), resolver, clock.clone()));
    Ok(Arc::new(QueueManager::new(config.clone(), store, executor, clock)))
}
