//! Coordinator configuration with environment overrides.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::queue::QueueConfig;
use crate::store::EventStoreConfig;

/// Settings for every component the coordinator owns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub queue: QueueConfig,
    pub store: EventStoreConfig,

    /// Window in which a repeated event ID is dropped per subscriber
    pub dedup_window: Duration,

    /// Config used by `get_circuit_breaker` when the caller passes none
    pub breaker: CircuitBreakerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            store: EventStoreConfig::default(),
            dedup_window: Duration::from_secs(5 * 60),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overlaid with `CONDUIT_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(enabled) = env_parse::<bool>("CONDUIT_STORE_ENABLED") {
            config.store.enabled = enabled;
        }
        if let Ok(dir) = std::env::var("CONDUIT_STORE_DIR") {
            if !dir.trim().is_empty() {
                config.store.storage_dir = PathBuf::from(dir);
            }
        }
        if let Some(max) = env_parse::<usize>("CONDUIT_STORE_MAX_EVENTS") {
            config.store.max_events = max.max(1);
        }
        if let Some(secs) = env_parse::<u64>("CONDUIT_STORE_FLUSH_INTERVAL_SECS") {
            config.store.flush_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(retain) = env_parse::<usize>("CONDUIT_STORE_RETAIN_SNAPSHOTS") {
            config.store.retain_snapshots = retain;
        }
        if let Some(secs) = env_parse::<u64>("CONDUIT_DEDUP_WINDOW_SECS") {
            config.dedup_window = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("CONDUIT_QUEUE_RETRY_DELAY_MS") {
            config.queue.retry_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = env_parse::<f64>("CONDUIT_QUEUE_BACKOFF_MULTIPLIER") {
            if multiplier.is_finite() && multiplier >= 1.0 {
                config.queue.backoff_multiplier = multiplier;
            } else {
                warn!(target: "coordinator", value = multiplier, "CONDUIT_QUEUE_BACKOFF_MULTIPLIER must be >= 1.0, keeping default");
            }
        }
        if let Some(capacity) = env_parse::<usize>("CONDUIT_DLQ_CAPACITY") {
            config.queue.dlq_capacity = capacity.max(1);
        }
        if let Some(max) = env_parse::<u32>("CONDUIT_BREAKER_MAX_FAILURES") {
            config.breaker.max_failures = max.max(1);
        }
        if let Some(ms) = env_parse::<u64>("CONDUIT_BREAKER_RESET_TIMEOUT_MS") {
            config.breaker.reset_timeout = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_store(mut self, store: EventStoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(target: "coordinator", key, value = %raw, "Ignoring unparseable environment value");
            None
        }
    }
}
