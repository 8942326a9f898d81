pub mod config;
pub mod dashboard;
pub mod error;
pub mod grading;
pub mod pipeline;
pub mod queue;
pub mod shutdown;
pub mod stages;
pub mod telemetry;

pub use error::{PipelineError, Result, StageError};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineWorkers};
