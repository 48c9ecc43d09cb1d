//! Engine configuration

use crate::store::ColdStoreConfig;
use std::time::Duration;

/// Configuration for the full hot/cold engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Redis connection string for the hot cache and the message bus
    pub redis_url: String,

    /// Cold store configuration
    pub cold_store: ColdStoreConfig,

    /// Datapoints per migration batch
    pub batch_size: i64,

    /// Deadline applied to each public engine operation
    pub op_timeout: Duration,

    /// How long a migrator blocks on an empty batch queue before re-checking
    /// its shutdown flag
    pub batch_wait: Duration,

    /// Whether inserts publish to the notifier
    pub enable_notifier: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            cold_store: ColdStoreConfig::default(),
            batch_size: crate::cache::DEFAULT_BATCH_SIZE,
            op_timeout: Duration::from_secs(30),
            batch_wait: Duration::from_secs(1),
            enable_notifier: true,
        }
    }
}
