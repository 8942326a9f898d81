use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::queue::store::JobStore;

/// Keeps an active job's heartbeat fresh so maintenance doesn't treat it as stalled.
#[derive(Debug, Clone, Copy)]
pub struct JobHeartbeat {
    interval: Duration,
}

impl JobHeartbeat {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Beat until the returned guard is dropped.
    pub fn start(&self, store: Arc<dyn JobStore>, job_id: Uuid) -> HeartbeatGuard {
        let mut interval = tokio::time::interval(self.interval);

        let handle = tokio::spawn(async move {
            // First tick completes immediately; the claim already set the heartbeat
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = store.heartbeat(&job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to record heartbeat");
                }
            }
        });

        HeartbeatGuard { handle }
    }
}

pub struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::{QueueJob, QueueName};
    use crate::queue::store::InMemoryJobStore;
    use serde_json::json;

    #[tokio::test]
    async fn refreshes_heartbeat_while_guard_lives() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        store
            .insert(QueueJob::new(QueueName::GitClone, json!({}), 1))
            .await
            .unwrap();
        let job = store.claim_next().await.unwrap().unwrap();
        let first_beat = job.heartbeat_at.unwrap();

        let guard = JobHeartbeat::new(Duration::from_millis(10)).start(store.clone(), job.id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);

        let beat = store.get(&job.id).await.unwrap().unwrap().heartbeat_at.unwrap();
        assert!(beat > first_beat);
    }
}
