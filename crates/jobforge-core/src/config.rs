//! Layered configuration. A plain `serde`-deserializable struct with
//! per-field defaults, the way the rest of this crate family loads config
//! (`#[serde(default)]` structs handed to a builder) rather than a
//! process-global resolved at use-sites. The host application is
//! responsible for loading a `QueueConfig` from TOML/env/flags and handing
//! it to [`crate::dispatch::QueueManager::new`] or a [`DriverFactory`].

use crate::error::JobforgeError;
use crate::job::BackoffStrategy;
use crate::store::JobStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Memory,
    Sync,
    Mysql,
    Pgsql,
    Sqlite,
}

impl Default for DriverKind {
    fn default() -> Self {
        DriverKind::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueueConfig {
    pub enabled: bool,
    pub driver: DriverKind,
    /// Connection string for the `mysql`/`pgsql`/`sqlite` drivers; unused
    /// by `memory`/`sync`.
    pub connection_url: Option<String>,
    pub default_queue: String,
    pub default_priority: i16,
    pub default_max_attempts: i32,
    pub default_timeout_seconds: i64,
    pub default_backoff: BackoffStrategy,
    pub default_retry_delay_seconds: i64,
    pub lease_grace_seconds: i64,
    pub purge_completed_age_days: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            driver: DriverKind::Memory,
            connection_url: None,
            default_queue: "default".to_string(),
            default_priority: 5,
            default_max_attempts: 3,
            default_timeout_seconds: 300,
            default_backoff: BackoffStrategy::Exponential,
            default_retry_delay_seconds: 60,
            lease_grace_seconds: 30,
            purge_completed_age_days: 7,
        }
    }
}

/// Separates driver *selection* from config *loading*: a `DriverFactory`
/// takes the already-parsed `QueueConfig` and produces the concrete store,
/// so the config layer never needs to know what a connection pool is.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn build(&self, config: &QueueConfig) -> Result<Arc<dyn JobStore>, JobforgeError>;
}
