use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{Result, StageError};
use crate::queue::context::JobContext;
use crate::queue::events::{EventBus, QueueEvent, QueueEventKind};
use crate::queue::handle::{JobHandle, JobOutcome, OutcomeWaiters};
use crate::queue::heartbeat::JobHeartbeat;
use crate::queue::job::{JobOptions, JobStatus, QueueJob, QueueName};
use crate::queue::store::JobStore;

/// The function a queue invokes for each attempt of a job.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn process(&self, job: &QueueJob, ctx: JobContext)
        -> std::result::Result<serde_json::Value, StageError>;
}

/// Behaviour shared by every job of one queue.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub retry: RetryPolicy,
    /// Wall-clock limit per attempt
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: None,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

pub(crate) struct QueueShared {
    pub(crate) name: QueueName,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) events: EventBus,
    pub(crate) settings: QueueSettings,
    pub(crate) waiters: OutcomeWaiters,
    pub(crate) wakeup: Notify,
}

/// A named, durable channel of jobs of one kind.
///
/// Cloning is cheap; all clones share the same store and workers.
#[derive(Clone)]
pub struct Queue {
    pub(crate) inner: Arc<QueueShared>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl Queue {
    pub fn new(
        name: QueueName,
        store: Arc<dyn JobStore>,
        events: EventBus,
        settings: QueueSettings,
    ) -> Self {
        Self {
            inner: Arc::new(QueueShared {
                name,
                store,
                events,
                settings,
                waiters: OutcomeWaiters::default(),
                wakeup: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> QueueName {
        self.inner.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    /// Add a job with the queue's default options.
    pub async fn enqueue<T: Serialize>(&self, payload: &T) -> Result<JobHandle> {
        self.enqueue_with(payload, JobOptions::default()).await
    }

    /// Add a job. Returns as soon as the job is stored; never waits for execution.
    pub async fn enqueue_with<T: Serialize>(
        &self,
        payload: &T,
        options: JobOptions,
    ) -> Result<JobHandle> {
        let payload = serde_json::to_value(payload)?;
        let attempts = options
            .attempts
            .unwrap_or(self.inner.settings.retry.attempts);
        let mut job = QueueJob::new(self.inner.name, payload, attempts);

        let delay = options.delay.filter(|d| !d.is_zero());
        if let Some(delay) = delay {
            job.mark_delayed(None, delay);
        }

        let id = job.id;
        // Register before inserting so a fast worker can't resolve an unknown job
        let rx = self.inner.waiters.register(id).await;
        if let Err(e) = self.inner.store.insert(job).await {
            self.inner.waiters.forget(&[id]).await;
            return Err(e);
        }

        match delay {
            Some(delay) => self.schedule_promotion(id, delay),
            None => {
                self.emit(id, QueueEventKind::Waiting);
                self.inner.wakeup.notify_one();
            }
        }

        Ok(JobHandle::new(
            id,
            self.inner.name,
            rx,
            self.inner.store.clone(),
            self.inner.settings.poll_interval,
        ))
    }

    pub async fn get_job(&self, id: &Uuid) -> Result<Option<QueueJob>> {
        self.inner.store.get(id).await
    }

    pub async fn jobs(&self, status: Option<JobStatus>) -> Result<Vec<QueueJob>> {
        self.inner.store.list(status).await
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for job in self.inner.store.list(None).await? {
            match job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Delayed => counts.delayed += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Start workers for this queue.
    ///
    /// At most `concurrency` jobs run at once. When `shutdown` is cancelled the
    /// loop stops claiming jobs and the returned task finishes once in-flight
    /// jobs are done.
    pub fn process<P: JobProcessor>(
        &self,
        concurrency: usize,
        processor: P,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        let processor: Arc<dyn JobProcessor> = Arc::new(processor);
        tokio::spawn(async move {
            queue
                .worker_loop(concurrency.max(1), processor, shutdown)
                .await
        })
    }

    async fn worker_loop(
        self,
        concurrency: usize,
        processor: Arc<dyn JobProcessor>,
        shutdown: CancellationToken,
    ) {
        let name = self.inner.name;
        let poll_interval = self.inner.settings.poll_interval;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let tracker = TaskTracker::new();

        tracing::info!(queue = %name, concurrency, "Queue workers started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.inner.store.claim_next().await {
                Ok(Some(job)) => {
                    let queue = self.clone();
                    let processor = processor.clone();
                    tracker.spawn(async move {
                        queue.run_job(job, processor).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.inner.wakeup.notified() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(queue = %name, error = %e, "Failed to claim next job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
            }
        }

        tracker.close();
        tracing::info!(queue = %name, in_flight = tracker.len(), "Queue workers draining");
        tracker.wait().await;
        tracing::info!(queue = %name, "Queue workers stopped");
    }

    async fn run_job(&self, job: QueueJob, processor: Arc<dyn JobProcessor>) {
        let name = self.inner.name;
        let settings = &self.inner.settings;
        let attempt = job.current_attempt();
        let span = tracing::info_span!("job", queue = %name, job_id = %job.id, attempt);

        async {
            tracing::debug!("Job started");
            self.emit(job.id, QueueEventKind::Active { attempt });

            let ctx = JobContext::new(
                job.id,
                name,
                attempt,
                job.max_attempts,
                self.inner.store.clone(),
                self.inner.events.clone(),
            );
            let heartbeat = JobHeartbeat::new(settings.heartbeat_interval)
                .start(self.inner.store.clone(), job.id);

            let attempt_fut = AssertUnwindSafe(processor.process(&job, ctx)).catch_unwind();
            let result = match settings.timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt_fut).await {
                    Ok(result) => result,
                    Err(_) => Ok(Err(StageError::Timeout(limit))),
                },
                None => attempt_fut.await,
            };
            drop(heartbeat);

            let result = result.unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(panic = %message, "Job processor panicked");
                Err(StageError::contract(format!("processor panicked: {}", message)))
            });

            self.finish(job, attempt, result).await;
        }
        .instrument(span)
        .await
    }

    async fn finish(
        &self,
        job: QueueJob,
        attempt: u32,
        result: std::result::Result<serde_json::Value, StageError>,
    ) {
        // Pick up progress written during the attempt
        let mut job = match self.inner.store.get(&job.id).await {
            Ok(Some(stored)) => stored,
            _ => job,
        };
        job.attempts_made = attempt;

        match result {
            Ok(value) => {
                job.mark_completed(value.clone());
                self.persist(&job).await;
                tracing::debug!("Job completed");
                self.emit(
                    job.id,
                    QueueEventKind::Completed {
                        attempts_made: attempt,
                    },
                );
                self.inner
                    .waiters
                    .resolve(&job.id, JobOutcome::Completed(value))
                    .await;
            }
            Err(err) if err.is_retryable() && job.has_attempts_left() => {
                let delay = self.inner.settings.retry.delay_for(attempt);
                let error = err.to_string();
                tracing::warn!(error = %error, delay_ms = delay.as_millis() as u64, "Job attempt failed, retrying");
                job.mark_delayed(Some(error.clone()), delay);
                self.persist(&job).await;
                self.emit(
                    job.id,
                    QueueEventKind::Retrying {
                        attempt,
                        delay,
                        error,
                    },
                );
                self.schedule_promotion(job.id, delay);
            }
            Err(err) => {
                let error = err.to_string();
                tracing::error!(error = %error, retryable = err.is_retryable(), "Job failed");
                job.mark_failed(error.clone());
                self.persist(&job).await;
                self.emit(
                    job.id,
                    QueueEventKind::Failed {
                        attempts_made: attempt,
                        error: error.clone(),
                    },
                );
                self.inner
                    .waiters
                    .resolve(
                        &job.id,
                        JobOutcome::Failed {
                            error,
                            attempts_made: attempt,
                        },
                    )
                    .await;
            }
        }
    }

    async fn persist(&self, job: &QueueJob) {
        if let Err(e) = self.inner.store.save(job).await {
            tracing::error!(queue = %self.inner.name, job_id = %job.id, error = %e, "Failed to persist job state");
        }
    }

    /// Move a delayed job back to waiting once its delay has elapsed.
    pub(crate) fn schedule_promotion(&self, id: Uuid, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match queue.inner.store.promote(&id).await {
                Ok(true) => {
                    queue.emit(id, QueueEventKind::Waiting);
                    queue.inner.wakeup.notify_one();
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(queue = %queue.inner.name, job_id = %id, error = %e, "Failed to promote delayed job");
                }
            }
        });
    }

    pub(crate) fn emit(&self, job_id: Uuid, kind: QueueEventKind) {
        self.inner
            .events
            .emit(QueueEvent::job(self.inner.name, job_id, kind));
    }
}
