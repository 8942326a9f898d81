use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::queue::events::{EventBus, QueueEvent};
use crate::queue::job::QueueName;
use crate::queue::store::{InMemoryJobStore, JobStore};
use crate::queue::worker::{Queue, QueueSettings};

/// The six pipeline queues, created once and shared by producers and workers.
#[derive(Debug, Clone)]
pub struct QueueRegistry {
    queues: Arc<[Queue; 6]>,
    events: EventBus,
}

impl QueueRegistry {
    /// Registry backed by process-local stores.
    pub fn in_memory(config: &PipelineConfig) -> Self {
        Self::with_stores(config, |_| Arc::new(InMemoryJobStore::new()))
    }

    /// Registry with a caller-supplied store per queue.
    pub fn with_stores<F>(config: &PipelineConfig, mut make_store: F) -> Self
    where
        F: FnMut(QueueName) -> Arc<dyn JobStore>,
    {
        let events = EventBus::new();
        let queues = QueueName::ALL.map(|name| {
            let settings = QueueSettings {
                retry: config.retry.clone(),
                timeout: config.timeouts.for_queue(name),
                poll_interval: config.workers.poll_interval(),
                heartbeat_interval: config.workers.heartbeat_interval(),
            };
            Queue::new(name, make_store(name), events.clone(), settings)
        });

        Self {
            queues: Arc::new(queues),
            events,
        }
    }

    /// Registry backed by Redis, one key space per queue.
    #[cfg(feature = "redis-store")]
    pub async fn redis(config: &PipelineConfig) -> Result<Self> {
        use crate::queue::redis_store::RedisJobStore;

        let client = redis::Client::open(config.store.redis_url())
            .map_err(|e| crate::error::PipelineError::Store(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| crate::error::PipelineError::Store(e.to_string()))?;

        let prefix = config.store.key_prefix.clone();
        Ok(Self::with_stores(config, |name| {
            Arc::new(RedisJobStore::new(conn.clone(), &prefix, name))
        }))
    }

    /// Registry for the configured backend.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        match config.store.backend {
            crate::config::StoreBackend::Memory => Ok(Self::in_memory(config)),
            #[cfg(feature = "redis-store")]
            crate::config::StoreBackend::Redis => Self::redis(config).await,
            #[cfg(not(feature = "redis-store"))]
            crate::config::StoreBackend::Redis => Err(crate::error::PipelineError::Config(
                ::config::ConfigError::Message(
                    "store.backend = \"redis\" requires the redis-store feature".to_string(),
                ),
            )),
        }
    }

    pub fn queue(&self, name: QueueName) -> &Queue {
        &self.queues[name as usize]
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Queue> {
        self.queues.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn every_queue_is_registered_under_its_name() {
        let registry = QueueRegistry::in_memory(&PipelineConfig::default());
        for name in QueueName::ALL {
            assert_eq!(registry.queue(name).name(), name);
        }
        assert_eq!(registry.iter().count(), 6);
    }

    #[test]
    fn queue_settings_follow_config() {
        let registry = QueueRegistry::in_memory(&PipelineConfig::default());
        let clone = registry.queue(QueueName::GitClone).settings();
        assert_eq!(clone.timeout, Some(Duration::from_secs(300)));
        assert_eq!(clone.retry.attempts, 3);
        assert_eq!(registry.queue(QueueName::Grading).settings().timeout, None);
    }

    #[tokio::test]
    async fn queues_share_one_event_bus() {
        let registry = QueueRegistry::in_memory(&PipelineConfig::default());
        let mut rx = registry.subscribe();
        registry
            .queue(QueueName::CodeAnalysis)
            .enqueue(&serde_json::json!({"workDir": "/tmp/x"}))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.queue, QueueName::CodeAnalysis);
    }
}
