//! Materializes a task name into a handler: a name-keyed map of
//! constructors rather than a reflective DI container. Registration is
//! explicit, resolution is a map lookup.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// A single callable entry point taking the decoded payload mapping. User
/// handler bodies implement this; the engine never inspects what's inside.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), String>;
}

impl std::fmt::Debug for dyn JobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn JobHandler")
    }
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum ResolutionError {
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("invalid handler for task: {0}")]
    InvalidHandler(String),
}

/// `resolve(taskName) -> handler`. The resolver may be backed by a DI
/// container, a custom factory, or direct construction — this trait is the
/// injection point, not a policy.
#[async_trait]
pub trait JobResolver: Send + Sync {
    async fn resolve(&self, task: &str) -> Result<Arc<dyn JobHandler>, ResolutionError>;
}

type HandlerFactory = Arc<dyn Fn() -> Arc<dyn JobHandler> + Send + Sync>;

/// In-process [`JobResolver`] backed by an explicit name -> constructor
/// map. This is the resolver every demo and test in this crate uses;
/// hosts wanting a DI container instead only need to provide their own
/// `JobResolver` impl.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    factories: Arc<DashMap<String, HandlerFactory>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler constructor under `name`. A fresh handler
    /// instance is produced per resolution, mirroring how most job-queue
    /// resolvers build a new handler object per attempt rather than
    /// sharing mutable handler state across jobs.
    pub fn register<F, H>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: JobHandler + 'static,
    {
        self.factories
            .insert(name.into(), Arc::new(move || Arc::new(factory()) as Arc<dyn JobHandler>));
    }

    /// Registers a handler that is already constructed and shared across
    /// every resolution — convenient for stateless handlers.
    pub fn register_shared(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.factories
            .insert(name.into(), Arc::new(move || handler.clone()));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

#[async_trait]
impl JobResolver for CommandRegistry {
    async fn resolve(&self, task: &str) -> Result<Arc<dyn JobHandler>, ResolutionError> {
        self.factories
            .get(task)
            .map(|factory| factory())
            .ok_or_else(|| ResolutionError::UnknownTask(task.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _payload: serde_json::Value) -> Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unregistered_task_is_unknown() {
        let registry = CommandRegistry::new();
        let err = registry.resolve("missing").await.unwrap_err();
        assert!(matches!(err, ResolutionError::UnknownTask(name) if name == "missing"));
    }

    #[tokio::test]
    async fn registered_task_resolves() {
        let registry = CommandRegistry::new();
        registry.register("noop", || Noop);
        let handler = registry.resolve("noop").await.unwrap();
        assert!(handler.handle(serde_json::json!({})).await.is_ok());
    }
}
