use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::queue::job::QueueName;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEventKind {
    Waiting,
    Active { attempt: u32 },
    Progress { progress: u8 },
    Completed { attempts_made: u32 },
    /// Attempt failed, another one is scheduled after `delay`
    Retrying {
        attempt: u32,
        #[serde(with = "duration_ms")]
        delay: Duration,
        error: String,
    },
    /// No attempts left, or the error was not retryable
    Failed { attempts_made: u32, error: String },
    Stalled { requeued: bool },
    Cleaned { removed: usize },
}

/// A queue-level event, keyed by queue and job id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEvent {
    pub queue: QueueName,
    /// `None` for queue-wide events such as retention cleanup
    pub job_id: Option<Uuid>,
    #[serde(flatten)]
    pub kind: QueueEventKind,
}

impl QueueEvent {
    pub fn job(queue: QueueName, job_id: Uuid, kind: QueueEventKind) -> Self {
        Self {
            queue,
            job_id: Some(job_id),
            kind,
        }
    }

    pub fn queue_wide(queue: QueueName, kind: QueueEventKind) -> Self {
        Self {
            queue,
            job_id: None,
            kind,
        }
    }
}

/// Fan-out of queue events to any number of observers.
///
/// Emitting never blocks; slow observers lag and lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: QueueEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
