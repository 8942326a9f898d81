use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::MultiplexedConnection, AsyncCommands};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::queue::job::{JobStatus, QueueJob, QueueName};
use crate::queue::store::{is_same_attempt, JobStore};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Conflicting writers on one job are rare; give up after this many re-reads.
const MAX_WRITE_RETRIES: usize = 32;

/// Compare-and-set of one job record.
///
/// KEYS: job hash, id set, wait list.
/// ARGV: expected revision (`*` = any, empty = must not exist), document,
/// job id, `1` to push the id onto the wait list, capacity (`0` = unbounded).
///
/// Returns 1 on success, 0 on a revision mismatch and -1 when full.
const WRITE_SCRIPT: &str = r#"
local rev = redis.call('HGET', KEYS[1], 'rev')
if ARGV[1] ~= '*' and (rev or '') ~= ARGV[1] then
  return 0
end
local cap = tonumber(ARGV[5])
if cap > 0 and not rev and redis.call('SCARD', KEYS[2]) >= cap then
  return -1
end
redis.call('HSET', KEYS[1], 'doc', ARGV[2])
redis.call('HINCRBY', KEYS[1], 'rev', 1)
redis.call('SADD', KEYS[2], ARGV[3])
if ARGV[4] == '1' then
  redis.call('LPUSH', KEYS[3], ARGV[3])
end
return 1
"#;

/// What a transition does to the record it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    /// Leave the stored record alone
    Skip,
    Write,
    /// Write and make the job claimable
    WriteAndQueue,
}

/// Revision a write must match.
#[derive(Debug, Clone, Copy)]
enum Expect {
    Any,
    Absent,
    Revision(u64),
}

impl Expect {
    fn as_arg(&self) -> String {
        match self {
            Expect::Any => "*".to_string(),
            Expect::Absent => String::new(),
            Expect::Revision(rev) => rev.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Written,
    Conflict,
    Full,
}

/// Job store kept in Redis so queued work survives a restart.
///
/// Layout per queue: one hash per job holding the JSON document (`doc`) and
/// a revision counter (`rev`), a set of all job ids and a list of waiting
/// ids (pushed left, popped right). Every state change is a compare-and-set
/// on `rev`, so concurrent workers and maintenance in other processes never
/// overwrite each other's transitions.
pub struct RedisJobStore {
    conn: MultiplexedConnection,
    job_prefix: String,
    ids_key: String,
    wait_key: String,
    max_jobs: usize,
}

impl RedisJobStore {
    pub fn new(conn: MultiplexedConnection, key_prefix: &str, queue: QueueName) -> Self {
        let base = format!("{}:{}", key_prefix, queue);
        tracing::debug!(prefix = %base, "RedisJobStore created");
        Self {
            conn,
            job_prefix: format!("{}:job:", base),
            ids_key: format!("{}:ids", base),
            wait_key: format!("{}:wait", base),
            max_jobs: DEFAULT_MAX_JOBS,
        }
    }

    pub fn with_capacity(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    fn job_key(&self, id: &Uuid) -> String {
        format!("{}{}", self.job_prefix, id)
    }

    async fn write(
        &self,
        job: &QueueJob,
        expect: Expect,
        queue: bool,
        capacity: usize,
    ) -> Result<WriteOutcome> {
        let data = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let result: i64 = redis::cmd("EVAL")
            .arg(WRITE_SCRIPT)
            .arg(3)
            .arg(self.job_key(&job.id))
            .arg(&self.ids_key)
            .arg(&self.wait_key)
            .arg(expect.as_arg())
            .arg(data)
            .arg(job.id.to_string())
            .arg(if queue { "1" } else { "0" })
            .arg(capacity)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(match result {
            1 => WriteOutcome::Written,
            -1 => WriteOutcome::Full,
            _ => WriteOutcome::Conflict,
        })
    }

    async fn read(&self, id: &Uuid) -> Result<Option<(QueueJob, u64)>> {
        let mut conn = self.conn.clone();
        let (doc, rev): (Option<String>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.job_key(id))
            .arg("doc")
            .arg("rev")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        match doc {
            Some(doc) => Ok(Some((serde_json::from_str(&doc)?, rev.unwrap_or(0)))),
            None => Ok(None),
        }
    }

    /// Apply `transition` to the stored job, re-reading on conflicting writes.
    ///
    /// Returns the written job, or `None` if the job is unknown or the
    /// transition skipped it.
    async fn modify<F>(&self, id: &Uuid, mut transition: F) -> Result<Option<QueueJob>>
    where
        F: FnMut(&mut QueueJob) -> Change + Send,
    {
        for _ in 0..MAX_WRITE_RETRIES {
            let Some((mut job, rev)) = self.read(id).await? else {
                return Ok(None);
            };
            let change = transition(&mut job);
            if change == Change::Skip {
                return Ok(None);
            }
            let queue = change == Change::WriteAndQueue;
            match self.write(&job, Expect::Revision(rev), queue, 0).await? {
                WriteOutcome::Written => return Ok(Some(job)),
                _ => tracing::debug!(job_id = %id, rev, "Job changed concurrently, retrying"),
            }
        }
        Err(PipelineError::Store(format!(
            "job {} kept changing, gave up after {} attempts",
            id, MAX_WRITE_RETRIES
        )))
    }
}

fn store_error(e: redis::RedisError) -> PipelineError {
    PipelineError::Store(e.to_string())
}

fn claim(job: &mut QueueJob) -> Change {
    if job.status == JobStatus::Waiting {
        job.mark_active();
        Change::Write
    } else {
        Change::Skip
    }
}

fn promote(job: &mut QueueJob) -> Change {
    if job.status == JobStatus::Delayed {
        job.mark_waiting();
        Change::WriteAndQueue
    } else {
        Change::Skip
    }
}

fn raise_progress(job: &mut QueueJob, progress: u8) -> Change {
    if job.status == JobStatus::Active && progress > job.progress {
        job.progress = progress;
        Change::Write
    } else {
        Change::Skip
    }
}

fn beat(job: &mut QueueJob) -> Change {
    if job.status == JobStatus::Active {
        job.heartbeat_at = Some(Utc::now());
        Change::Write
    } else {
        Change::Skip
    }
}

/// Replace the stored attempt with `next` if it is still the one `next` was read from.
fn replace_attempt(stored: &mut QueueJob, next: &QueueJob, queue: bool) -> Change {
    if !is_same_attempt(stored, next) {
        return Change::Skip;
    }
    *stored = next.clone();
    if queue {
        Change::WriteAndQueue
    } else {
        Change::Write
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, job: QueueJob) -> Result<()> {
        let queue = job.status == JobStatus::Waiting;
        match self.write(&job, Expect::Absent, queue, self.max_jobs).await? {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::Full => Err(PipelineError::QueueFull(job.queue.to_string())),
            WriteOutcome::Conflict => Err(PipelineError::Store(format!(
                "job {} already exists",
                job.id
            ))),
        }
    }

    async fn claim_next(&self) -> Result<Option<QueueJob>> {
        let mut conn = self.conn.clone();
        loop {
            let next: Option<String> = conn
                .rpop(&self.wait_key, None)
                .await
                .map_err(store_error)?;
            let Some(raw) = next else {
                return Ok(None);
            };
            let Ok(id) = Uuid::parse_str(&raw) else {
                tracing::warn!(key = %self.wait_key, value = %raw, "Skipping malformed job id");
                continue;
            };
            // Ids of removed or already-moved jobs are skipped
            if let Some(job) = self.modify(&id, claim).await? {
                return Ok(Some(job));
            }
        }
    }

    async fn save(&self, job: &QueueJob) -> Result<()> {
        self.write(job, Expect::Any, false, 0).await?;
        Ok(())
    }

    async fn promote(&self, id: &Uuid) -> Result<bool> {
        Ok(self.modify(id, promote).await?.is_some())
    }

    async fn requeue(&self, mut job: QueueJob) -> Result<bool> {
        let id = job.id;
        job.mark_waiting();
        Ok(self
            .modify(&id, |stored| replace_attempt(stored, &job, true))
            .await?
            .is_some())
    }

    async fn replace_active(&self, job: &QueueJob) -> Result<bool> {
        Ok(self
            .modify(&job.id, |stored| replace_attempt(stored, job, false))
            .await?
            .is_some())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<QueueJob>> {
        Ok(self.read(id).await?.map(|(job, _)| job))
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<QueueJob>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(&self.ids_key).await.map_err(store_error)?;
        let mut jobs = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(id) = Uuid::parse_str(&raw) else {
                continue;
            };
            if let Some((job, _)) = self.read(&id).await? {
                if status.map_or(true, |s| job.status == s) {
                    jobs.push(job);
                }
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn remove(&self, ids: &[Uuid]) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut removed = 0;
        for id in ids {
            let (deleted, _): (usize, usize) = redis::pipe()
                .atomic()
                .del(self.job_key(id))
                .srem(&self.ids_key, id.to_string())
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;
            removed += deleted;
        }
        Ok(removed)
    }

    async fn update_progress(&self, id: &Uuid, progress: u8) -> Result<Option<u8>> {
        let progress = progress.min(100);
        Ok(self
            .modify(id, |job| raise_progress(job, progress))
            .await?
            .map(|job| job.progress))
    }

    async fn heartbeat(&self, id: &Uuid) -> Result<()> {
        self.modify(id, beat).await?;
        Ok(())
    }
}
