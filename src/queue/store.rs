use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::queue::job::{JobStatus, QueueJob};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Persistence for the jobs of one queue.
///
/// `claim_next` must hand each waiting job to exactly one caller; everything
/// else is plain record keeping.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new job. Waiting jobs become claimable immediately.
    async fn insert(&self, job: QueueJob) -> Result<()>;

    /// Pop the oldest waiting job and mark it active.
    async fn claim_next(&self) -> Result<Option<QueueJob>>;

    /// Overwrite a job record.
    async fn save(&self, job: &QueueJob) -> Result<()>;

    /// Move a delayed job back to waiting. Returns false if it was not delayed.
    async fn promote(&self, id: &Uuid) -> Result<bool>;

    /// Store the job as waiting and make it claimable again, provided the
    /// stored record is still the attempt `job` was read from. Returns false
    /// if the job moved on in the meantime.
    async fn requeue(&self, job: QueueJob) -> Result<bool>;

    /// Overwrite a job only while the stored record is still the active
    /// attempt `job` was read from. Returns false if the job moved on.
    async fn replace_active(&self, job: &QueueJob) -> Result<bool>;

    async fn get(&self, id: &Uuid) -> Result<Option<QueueJob>>;

    /// All jobs, optionally filtered by status, oldest first.
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<QueueJob>>;

    /// Remove jobs by id. Returns the number removed.
    async fn remove(&self, ids: &[Uuid]) -> Result<usize>;

    /// Raise the progress of an active job. Returns the new value, or `None`
    /// if the update was ignored (unknown job or not an increase).
    async fn update_progress(&self, id: &Uuid, progress: u8) -> Result<Option<u8>>;

    /// Refresh the heartbeat of an active job.
    async fn heartbeat(&self, id: &Uuid) -> Result<()>;
}

/// `stored` is still the active attempt that `job` is a copy of.
pub(crate) fn is_same_attempt(stored: &QueueJob, job: &QueueJob) -> bool {
    stored.status == JobStatus::Active && stored.processed_at == job.processed_at
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, QueueJob>,
    waiting: VecDeque<Uuid>,
}

/// Process-local job store. Fast and test friendly, but not durable.
#[derive(Debug)]
pub struct InMemoryJobStore {
    state: Mutex<MemoryState>,
    max_jobs: usize,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            max_jobs,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: QueueJob) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.jobs.len() >= self.max_jobs {
            return Err(PipelineError::QueueFull(job.queue.to_string()));
        }
        if job.status == JobStatus::Waiting {
            state.waiting.push_back(job.id);
        }
        state.jobs.insert(job.id, job);
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<QueueJob>> {
        let mut state = self.state.lock().await;
        while let Some(id) = state.waiting.pop_front() {
            // Ids of removed or already-moved jobs are skipped
            if let Some(job) = state.jobs.get_mut(&id) {
                if job.status == JobStatus::Waiting {
                    job.mark_active();
                    return Ok(Some(job.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn save(&self, job: &QueueJob) -> Result<()> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn promote(&self, id: &Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Delayed => {
                job.mark_waiting();
                state.waiting.push_back(*id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue(&self, mut job: QueueJob) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.jobs.get(&job.id).is_some_and(|stored| is_same_attempt(stored, &job)) {
            return Ok(false);
        }
        job.mark_waiting();
        state.waiting.push_back(job.id);
        state.jobs.insert(job.id, job);
        Ok(true)
    }

    async fn replace_active(&self, job: &QueueJob) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job.id) {
            Some(stored) if is_same_attempt(stored, job) => {
                *stored = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: &Uuid) -> Result<Option<QueueJob>> {
        Ok(self.state.lock().await.jobs.get(id).cloned())
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<QueueJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<QueueJob> = state
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn remove(&self, ids: &[Uuid]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let removed = ids
            .iter()
            .filter(|id| state.jobs.remove(id).is_some())
            .count();
        Ok(removed)
    }

    async fn update_progress(&self, id: &Uuid, progress: u8) -> Result<Option<u8>> {
        let progress = progress.min(100);
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Active && progress > job.progress => {
                job.progress = progress;
                Ok(Some(progress))
            }
            _ => Ok(None),
        }
    }

    async fn heartbeat(&self, id: &Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(id) {
            if job.status == JobStatus::Active {
                job.heartbeat_at = Some(Utc::now());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::QueueName;
    use serde_json::json;
    use std::time::Duration;

    fn job() -> QueueJob {
        QueueJob::new(QueueName::GitClone, json!({"submissionId": "s1"}), 3)
    }

    #[tokio::test]
    async fn claim_is_fifo_and_marks_active() {
        let store = InMemoryJobStore::new();
        let first = job();
        let second = job();
        let first_id = first.id;
        store.insert(first).await.unwrap();
        store.insert(second).await.unwrap();

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, first_id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(
            store.get(&first_id).await.unwrap().unwrap().status,
            JobStatus::Active
        );

        assert!(store.claim_next().await.unwrap().is_some());
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_fails_at_capacity() {
        let store = InMemoryJobStore::with_capacity(1);
        store.insert(job()).await.unwrap();
        let err = store.insert(job()).await.unwrap_err();
        assert!(matches!(err, PipelineError::QueueFull(ref q) if q == "git-clone"));
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_claimable_until_promoted() {
        let store = InMemoryJobStore::new();
        let mut delayed = job();
        delayed.mark_delayed(Some("retry".to_string()), Duration::from_secs(5));
        let id = delayed.id;
        store.insert(delayed).await.unwrap();

        assert!(store.claim_next().await.unwrap().is_none());
        assert!(store.promote(&id).await.unwrap());
        // A second promotion is a no-op
        assert!(!store.promote(&id).await.unwrap());

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
    }

    #[tokio::test]
    async fn progress_only_increases_for_active_jobs() {
        let store = InMemoryJobStore::new();
        let j = job();
        let id = j.id;
        store.insert(j).await.unwrap();

        // Waiting jobs don't report progress
        assert_eq!(store.update_progress(&id, 10).await.unwrap(), None);

        store.claim_next().await.unwrap();
        assert_eq!(store.update_progress(&id, 10).await.unwrap(), Some(10));
        assert_eq!(store.update_progress(&id, 5).await.unwrap(), None);
        assert_eq!(store.update_progress(&id, 10).await.unwrap(), None);
        assert_eq!(store.update_progress(&id, 250).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn list_filters_by_status_and_remove_deletes() {
        let store = InMemoryJobStore::new();
        let a = job();
        let b = job();
        let a_id = a.id;
        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();
        store.claim_next().await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        assert_eq!(store.list(Some(JobStatus::Active)).await.unwrap().len(), 1);
        assert_eq!(store.list(Some(JobStatus::Waiting)).await.unwrap().len(), 1);

        assert_eq!(store.remove(&[a_id, Uuid::new_v4()]).await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn requeue_makes_job_claimable_again() {
        let store = InMemoryJobStore::new();
        store.insert(job()).await.unwrap();
        let mut claimed = store.claim_next().await.unwrap().unwrap();
        claimed.attempts_made = 1;

        assert!(store.requeue(claimed.clone()).await.unwrap());
        let again = store.claim_next().await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.attempts_made, 1);
    }

    #[tokio::test]
    async fn stale_copies_cannot_overwrite_a_finished_job() {
        let store = InMemoryJobStore::new();
        store.insert(job()).await.unwrap();
        let stale = store.claim_next().await.unwrap().unwrap();

        let mut finished = stale.clone();
        finished.attempts_made = 1;
        finished.mark_completed(json!({"ok": true}));
        store.save(&finished).await.unwrap();

        let mut failed = stale.clone();
        failed.mark_failed("stalled".to_string());
        assert!(!store.replace_active(&failed).await.unwrap());
        assert!(!store.requeue(stale).await.unwrap());

        let stored = store.get(&finished.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaimed_job_is_a_different_attempt() {
        let store = InMemoryJobStore::new();
        store.insert(job()).await.unwrap();
        let first = store.claim_next().await.unwrap().unwrap();
        assert!(store.requeue(first.clone()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store.claim_next().await.unwrap().unwrap();

        // A second recovery based on the first claim is ignored
        assert!(!store.requeue(first).await.unwrap());
        assert!(store.replace_active(&second).await.unwrap());
    }
}
