use std::sync::Arc;

use uuid::Uuid;

use crate::queue::events::{EventBus, QueueEvent, QueueEventKind};
use crate::queue::job::QueueName;
use crate::queue::store::{InMemoryJobStore, JobStore};

/// Handed to a processor for each attempt of a job.
#[derive(Clone)]
pub struct JobContext {
    job_id: Uuid,
    queue: QueueName,
    attempt: u32,
    max_attempts: u32,
    store: Arc<dyn JobStore>,
    events: EventBus,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl JobContext {
    pub(crate) fn new(
        job_id: Uuid,
        queue: QueueName,
        attempt: u32,
        max_attempts: u32,
        store: Arc<dyn JobStore>,
        events: EventBus,
    ) -> Self {
        Self {
            job_id,
            queue,
            attempt,
            max_attempts,
            store,
            events,
        }
    }

    /// A context that is not backed by a running queue. Progress reports go
    /// nowhere. Useful for invoking a stage handler directly.
    pub fn standalone(queue: QueueName) -> Self {
        Self::new(
            Uuid::new_v4(),
            queue,
            1,
            1,
            Arc::new(InMemoryJobStore::new()),
            EventBus::new(),
        )
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Report progress (0-100). Values that don't raise the current progress
    /// are dropped, so observers only ever see it go up.
    pub async fn progress(&self, progress: u8) {
        match self.store.update_progress(&self.job_id, progress).await {
            Ok(Some(progress)) => {
                self.events.emit(QueueEvent::job(
                    self.queue,
                    self.job_id,
                    QueueEventKind::Progress { progress },
                ));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, queue = %self.queue, error = %e, "Failed to record progress");
            }
        }
    }
}
