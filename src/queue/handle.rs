use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::queue::job::{JobStatus, QueueJob, QueueName};
use crate::queue::store::JobStore;

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(serde_json::Value),
    Failed { error: String, attempts_made: u32 },
}

impl JobOutcome {
    /// The outcome recorded on a job, if it has finished.
    pub fn from_job(job: &QueueJob) -> Option<Self> {
        match job.status {
            JobStatus::Completed => Some(JobOutcome::Completed(
                job.return_value.clone().unwrap_or(serde_json::Value::Null),
            )),
            JobStatus::Failed => Some(JobOutcome::Failed {
                error: job
                    .failed_reason
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
                attempts_made: job.attempts_made,
            }),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }
}

/// Returned by `enqueue`. Dropping it does not affect the job.
pub struct JobHandle {
    id: Uuid,
    queue: QueueName,
    rx: watch::Receiver<Option<JobOutcome>>,
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .finish()
    }
}

impl JobHandle {
    pub(crate) fn new(
        id: Uuid,
        queue: QueueName,
        rx: watch::Receiver<Option<JobOutcome>>,
        store: Arc<dyn JobStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            rx,
            store,
            poll_interval,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Wait until the job completes or fails for good.
    ///
    /// Outcomes produced in this process arrive through the in-process
    /// notifier; the store is polled as well so a job finished by another
    /// worker process is still observed.
    pub async fn outcome(mut self) -> JobOutcome {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut notifier_open = true;

        loop {
            if let Some(outcome) = self.rx.borrow_and_update().clone() {
                return outcome;
            }

            if notifier_open {
                tokio::select! {
                    changed = self.rx.changed() => {
                        if changed.is_err() {
                            notifier_open = false;
                        }
                        continue;
                    }
                    _ = poll.tick() => {}
                }
            } else {
                poll.tick().await;
            }

            match self.store.get(&self.id).await {
                Ok(Some(job)) => {
                    if let Some(outcome) = JobOutcome::from_job(&job) {
                        return outcome;
                    }
                }
                Ok(None) => {
                    return JobOutcome::Failed {
                        error: format!("job {} no longer exists in queue {}", self.id, self.queue),
                        attempts_made: 0,
                    };
                }
                Err(e) => {
                    tracing::warn!(job_id = %self.id, queue = %self.queue, error = %e, "Failed to poll job state");
                }
            }
        }
    }
}

/// In-process notifiers for jobs that somebody may be waiting on.
#[derive(Debug, Default)]
pub(crate) struct OutcomeWaiters {
    senders: Mutex<HashMap<Uuid, watch::Sender<Option<JobOutcome>>>>,
}

impl OutcomeWaiters {
    pub async fn register(&self, id: Uuid) -> watch::Receiver<Option<JobOutcome>> {
        let (tx, rx) = watch::channel(None);
        self.senders.lock().await.insert(id, tx);
        rx
    }

    pub async fn resolve(&self, id: &Uuid, outcome: JobOutcome) {
        if let Some(tx) = self.senders.lock().await.remove(id) {
            // Receivers may be gone; the outcome is in the store either way
            let _ = tx.send(Some(outcome));
        }
    }

    pub async fn forget(&self, ids: &[Uuid]) {
        let mut senders = self.senders.lock().await;
        for id in ids {
            senders.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::InMemoryJobStore;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_through_notifier() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job = QueueJob::new(QueueName::GitClone, json!({}), 3);
        let id = job.id;
        store.insert(job).await.unwrap();

        let waiters = OutcomeWaiters::default();
        let rx = waiters.register(id).await;
        let handle = JobHandle::new(id, QueueName::GitClone, rx, store, Duration::from_secs(60));

        waiters
            .resolve(&id, JobOutcome::Completed(json!({"commitHash": "abc"})))
            .await;

        assert_eq!(
            handle.outcome().await,
            JobOutcome::Completed(json!({"commitHash": "abc"}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_polling_the_store() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let mut job = QueueJob::new(QueueName::GitClone, json!({}), 3);
        let id = job.id;
        store.insert(job.clone()).await.unwrap();

        // Notifier dropped without ever resolving, as if another process ran the job
        let (tx, rx) = watch::channel(None);
        drop(tx);
        let handle = JobHandle::new(
            id,
            QueueName::GitClone,
            rx,
            store.clone(),
            Duration::from_millis(100),
        );

        job.attempts_made = 3;
        job.mark_failed("exhausted".to_string());
        store.save(&job).await.unwrap();

        assert_eq!(
            handle.outcome().await,
            JobOutcome::Failed {
                error: "exhausted".to_string(),
                attempts_made: 3
            }
        );
    }

    #[test]
    fn outcome_from_unfinished_job_is_none() {
        let job = QueueJob::new(QueueName::Grading, json!({}), 3);
        assert!(JobOutcome::from_job(&job).is_none());
    }
}
