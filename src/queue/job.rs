use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// The six named queues of the grading pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Grading,
    GitClone,
    TestExecution,
    CodeAnalysis,
    GptEvaluation,
    ReportGeneration,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::Grading,
        QueueName::GitClone,
        QueueName::TestExecution,
        QueueName::CodeAnalysis,
        QueueName::GptEvaluation,
        QueueName::ReportGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Grading => "grading",
            QueueName::GitClone => "git-clone",
            QueueName::TestExecution => "test-execution",
            QueueName::CodeAnalysis => "code-analysis",
            QueueName::GptEvaluation => "gpt-evaluation",
            QueueName::ReportGeneration => "report-generation",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.as_str() == name)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Delayed,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn parse(status: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.to_string() == status)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Delayed => write!(f, "delayed"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-enqueue overrides of the queue defaults.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub attempts: Option<u32>,
    pub delay: Option<Duration>,
}

impl JobOptions {
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// One unit of work in a queue, as persisted by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub progress: u8,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// When a delayed job becomes eligible to run again
    pub available_at: Option<DateTime<Utc>>,
}

impl QueueJob {
    pub fn new(queue: QueueName, payload: serde_json::Value, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue,
            payload,
            status: JobStatus::Waiting,
            attempts_made: 0,
            max_attempts: max_attempts.max(1),
            progress: 0,
            failed_reason: None,
            return_value: None,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            heartbeat_at: None,
            available_at: None,
        }
    }

    /// The 1-based number of the attempt that is (or will be) running.
    pub fn current_attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    pub fn mark_active(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Active;
        self.processed_at = Some(now);
        self.heartbeat_at = Some(now);
        self.available_at = None;
    }

    pub fn mark_completed(&mut self, value: serde_json::Value) {
        self.status = JobStatus::Completed;
        self.return_value = Some(value);
        self.failed_reason = None;
        self.finished_at = Some(Utc::now());
        self.heartbeat_at = None;
    }

    pub fn mark_failed(&mut self, reason: String) {
        self.status = JobStatus::Failed;
        self.failed_reason = Some(reason);
        self.finished_at = Some(Utc::now());
        self.heartbeat_at = None;
    }

    pub fn mark_delayed(&mut self, reason: Option<String>, delay: Duration) {
        self.status = JobStatus::Delayed;
        self.failed_reason = reason;
        self.heartbeat_at = None;
        self.available_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));
    }

    pub fn mark_waiting(&mut self) {
        self.status = JobStatus::Waiting;
        self.available_at = None;
        self.heartbeat_at = None;
    }
}
