use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Queue {0} is at capacity")]
    QueueFull(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid grading request: {0}")]
    InvalidRequest(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure raised by a job processor.
///
/// The variant decides whether the queue spends another attempt on the job:
/// only `Transient` and `Timeout` are retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("contract violation: {0}")]
    Contract(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        StageError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        StageError::Permanent(msg.into())
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        StageError::Contract(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Transient(_) | StageError::Timeout(_))
    }
}

impl From<PipelineError> for StageError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Serialization(e) => StageError::Contract(e.to_string()),
            PipelineError::InvalidRequest(msg) => StageError::Permanent(msg),
            other => StageError::Transient(other.to_string()),
        }
    }
}
