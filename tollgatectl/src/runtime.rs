use std::sync::Arc;

use anyhow::Context;
use tollgate_config::TollgateConfig;
use tollgate_core::{CoordinationStore, MemoryStore, RateLimiterSet, RedisStore, TaskQueue};
use tracing::{info, warn};

/// Store-backed handles built from resolved configuration.
#[derive(Debug)]
pub struct Runtime {
    pub config: TollgateConfig,
    pub queue: Arc<TaskQueue>,
    pub limiters: RateLimiterSet,
}

impl Runtime {
    pub async fn connect(config: &TollgateConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn CoordinationStore> = match &config.redis {
            Some(redis) => {
                let store = RedisStore::connect(&redis.url)
                    .await
                    .context("failed to connect to Redis")?;
                Arc::new(store)
            }
            None => {
                warn!("no Redis configured; operating on an empty in-process store");
                Arc::new(MemoryStore::new())
            }
        };

        let queue = Arc::new(TaskQueue::new(store.clone(), config.queue_settings()));
        let limiters = RateLimiterSet::from_rules(store, config.rate_limit_rules())
            .context("invalid rate limiter configuration")?;
        info!(queue = %queue.name(), limiters = limiters.len(), "tollgatectl ready");

        Ok(Self {
            config: config.clone(),
            queue,
            limiters,
        })
    }

    pub fn limiter(&self, name: &str) -> anyhow::Result<&tollgate_core::SlidingWindowLimiter> {
        self.limiters.get(name).with_context(|| {
            format!(
                "unknown rate limiter '{name}' (configured: {})",
                self.limiters.names().join(", ")
            )
        })
    }
}
