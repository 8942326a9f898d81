use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{PipelineConfig, RetentionPolicy};
use crate::error::Result;
use crate::queue::events::{QueueEvent, QueueEventKind};
use crate::queue::handle::JobOutcome;
use crate::queue::job::JobStatus;
use crate::queue::registry::QueueRegistry;
use crate::queue::worker::Queue;

/// What one maintenance pass did to a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub removed: usize,
    pub requeued: usize,
    pub failed: usize,
    pub promoted: usize,
}

impl Queue {
    /// Drop finished jobs that fell out of the retention window.
    ///
    /// Completed jobs are kept for `completed_age` and at most
    /// `completed_count` of them (newest first). Failed jobs are kept for
    /// `failed_age`. Returns the number of removed jobs.
    pub async fn clean(&self, retention: &RetentionPolicy) -> Result<usize> {
        let now = Utc::now();
        let mut expired: Vec<Uuid> = Vec::new();

        let mut completed = self.inner.store.list(Some(JobStatus::Completed)).await?;
        completed.sort_by_key(|j| std::cmp::Reverse(j.finished_at.unwrap_or(j.created_at)));
        for (rank, job) in completed.iter().enumerate() {
            let finished = job.finished_at.unwrap_or(job.created_at);
            if rank >= retention.completed_count || now - finished > retention.completed_age() {
                expired.push(job.id);
            }
        }

        for job in self.inner.store.list(Some(JobStatus::Failed)).await? {
            let finished = job.finished_at.unwrap_or(job.created_at);
            if now - finished > retention.failed_age() {
                expired.push(job.id);
            }
        }

        if expired.is_empty() {
            return Ok(0);
        }

        let removed = self.inner.store.remove(&expired).await?;
        self.inner.waiters.forget(&expired).await;
        tracing::debug!(queue = %self.inner.name, removed, "Cleaned expired jobs");
        self.inner.events.emit(QueueEvent::queue_wide(
            self.inner.name,
            QueueEventKind::Cleaned { removed },
        ));
        Ok(removed)
    }

    /// Recover active jobs whose worker stopped sending heartbeats.
    ///
    /// The lost attempt counts against the job. Jobs with attempts left go
    /// back to waiting; the rest fail. Returns `(requeued, failed)`.
    pub async fn recover_stalled(&self, stalled_after: Duration) -> Result<(usize, usize)> {
        let now = Utc::now();
        let limit = chrono::Duration::milliseconds(stalled_after.as_millis() as i64);
        let mut requeued = 0;
        let mut failed = 0;

        for mut job in self.inner.store.list(Some(JobStatus::Active)).await? {
            let last_seen = job
                .heartbeat_at
                .or(job.processed_at)
                .unwrap_or(job.created_at);
            if now - last_seen <= limit {
                continue;
            }

            job.attempts_made += 1;
            if job.has_attempts_left() {
                let (id, attempts_made) = (job.id, job.attempts_made);
                if !self.inner.store.requeue(job).await? {
                    tracing::debug!(queue = %self.inner.name, job_id = %id, "Stalled job moved on, skipped");
                    continue;
                }
                tracing::warn!(queue = %self.inner.name, job_id = %id, attempts_made, "Stalled job requeued");
                self.emit(id, QueueEventKind::Stalled { requeued: true });
                self.inner.wakeup.notify_one();
                requeued += 1;
            } else {
                let error = "job stalled more than allowable limit".to_string();
                job.mark_failed(error.clone());
                if !self.inner.store.replace_active(&job).await? {
                    tracing::debug!(queue = %self.inner.name, job_id = %job.id, "Stalled job moved on, skipped");
                    continue;
                }
                tracing::error!(queue = %self.inner.name, job_id = %job.id, "Stalled job failed");
                self.emit(job.id, QueueEventKind::Stalled { requeued: false });
                self.emit(
                    job.id,
                    QueueEventKind::Failed {
                        attempts_made: job.attempts_made,
                        error: error.clone(),
                    },
                );
                self.inner
                    .waiters
                    .resolve(
                        &job.id,
                        JobOutcome::Failed {
                            error,
                            attempts_made: job.attempts_made,
                        },
                    )
                    .await;
                failed += 1;
            }
        }

        Ok((requeued, failed))
    }

    /// Promote delayed jobs whose delay has passed but whose in-process timer
    /// is gone, e.g. because they were scheduled by a process that exited.
    pub async fn promote_overdue(&self) -> Result<usize> {
        let now = Utc::now();
        let mut promoted = 0;
        for job in self.inner.store.list(Some(JobStatus::Delayed)).await? {
            if job.available_at.map_or(true, |at| at <= now)
                && self.inner.store.promote(&job.id).await?
            {
                self.emit(job.id, QueueEventKind::Waiting);
                promoted += 1;
            }
        }
        if promoted > 0 {
            self.inner.wakeup.notify_waiters();
        }
        Ok(promoted)
    }

    /// One full maintenance pass.
    pub async fn maintain(
        &self,
        retention: &RetentionPolicy,
        stalled_after: Duration,
    ) -> Result<MaintenanceReport> {
        let (requeued, failed) = self.recover_stalled(stalled_after).await?;
        let promoted = self.promote_overdue().await?;
        let removed = self.clean(retention).await?;
        Ok(MaintenanceReport {
            removed,
            requeued,
            failed,
            promoted,
        })
    }
}

/// Run maintenance over every queue on a fixed interval until `shutdown`.
pub fn spawn_maintenance(
    registry: QueueRegistry,
    config: &PipelineConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let retention = config.retention.clone();
    let stalled_after = config.workers.stalled_timeout();
    let period = config.workers.maintenance_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for queue in registry.iter() {
                match queue.maintain(&retention, stalled_after).await {
                    Ok(report) if report != MaintenanceReport::default() => {
                        tracing::info!(
                            queue = %queue.name(),
                            removed = report.removed,
                            requeued = report.requeued,
                            failed = report.failed,
                            promoted = report.promoted,
                            "Maintenance pass"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(queue = %queue.name(), error = %e, "Maintenance pass failed");
                    }
                }
            }
        }

        tracing::debug!("Maintenance stopped");
    })
}
