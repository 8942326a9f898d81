//! Stage handlers: the pluggable work behind each stage queue.
//!
//! A handler receives a typed stage job and returns a typed stage result.
//! [`StageProcessor`] adapts it to the untyped [`JobProcessor`] a queue runs,
//! turning malformed payloads and `success: false` results into contract
//! violations.
//!
//! Default handlers:
//! - [`GitCloneHandler`]: `git clone --depth 1` into the work directory
//! - [`SandboxTestRunner`]: Jest inside a locked-down `docker run`
//! - [`SourceTreeAnalyzer`]: file/line/language summary of the work directory
//! - [`OpenAiEvaluator`]: per-criterion score from an OpenAI-compatible API
//! - [`MarkdownReportWriter`]: markdown report on disk, `file://` locator

pub mod clone;
pub mod code_analysis;
pub mod gpt_evaluation;
pub mod jobs;
pub mod report;
pub mod test_execution;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::{Result, StageError};
use crate::queue::{JobContext, JobProcessor, QueueJob, QueueName};

pub use clone::GitCloneHandler;
pub use code_analysis::SourceTreeAnalyzer;
pub use gpt_evaluation::OpenAiEvaluator;
pub use jobs::*;
pub use report::MarkdownReportWriter;
pub use test_execution::SandboxTestRunner;

/// A phase of grading, as reported in failures and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Before any stage ran (request accepted, inputs being resolved)
    Accepted,
    Clone,
    TestExecution,
    CodeAnalysis,
    GptEvaluation,
    ReportGeneration,
}

impl Stage {
    pub const PIPELINE: [Stage; 5] = [
        Stage::Clone,
        Stage::TestExecution,
        Stage::CodeAnalysis,
        Stage::GptEvaluation,
        Stage::ReportGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Accepted => "accepted",
            Stage::Clone => "clone",
            Stage::TestExecution => "test-execution",
            Stage::CodeAnalysis => "code-analysis",
            Stage::GptEvaluation => "gpt-evaluation",
            Stage::ReportGeneration => "report-generation",
        }
    }

    /// The queue that runs this stage.
    pub fn queue(&self) -> Option<QueueName> {
        match self {
            Stage::Accepted => None,
            Stage::Clone => Some(QueueName::GitClone),
            Stage::TestExecution => Some(QueueName::TestExecution),
            Stage::CodeAnalysis => Some(QueueName::CodeAnalysis),
            Stage::GptEvaluation => Some(QueueName::GptEvaluation),
            Stage::ReportGeneration => Some(QueueName::ReportGeneration),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The work of one stage.
///
/// Return `StageError::Permanent` for failures another attempt cannot fix
/// (bad URL, unparseable test output) so the queue skips remaining retries.
#[async_trait]
pub trait StageHandler<I, O>: Send + Sync {
    async fn handle(&self, job: I, ctx: &JobContext) -> std::result::Result<O, StageError>;
}

/// Runs a typed [`StageHandler`] as a queue processor.
pub struct StageProcessor<I, O> {
    stage: Stage,
    handler: Arc<dyn StageHandler<I, O>>,
}

impl<I, O> StageProcessor<I, O> {
    pub fn new(stage: Stage, handler: Arc<dyn StageHandler<I, O>>) -> Self {
        Self { stage, handler }
    }
}

#[async_trait]
impl<I, O> JobProcessor for StageProcessor<I, O>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + StageOutput + Send + 'static,
{
    async fn process(
        &self,
        job: &QueueJob,
        ctx: JobContext,
    ) -> std::result::Result<serde_json::Value, StageError> {
        let input: I = serde_json::from_value(job.payload.clone()).map_err(|e| {
            StageError::contract(format!("malformed {} job payload: {}", self.stage, e))
        })?;

        let output = self.handler.handle(input, &ctx).await?;
        if !output.succeeded() {
            return Err(StageError::contract(format!(
                "{} handler returned an unsuccessful result",
                self.stage
            )));
        }

        serde_json::to_value(&output).map_err(|e| {
            StageError::contract(format!("unserializable {} result: {}", self.stage, e))
        })
    }
}

/// One handler per stage. Replace any of them to change how a stage works;
/// the orchestrator only relies on the job/result shapes.
#[derive(Clone)]
pub struct StageHandlers {
    pub clone: Arc<dyn StageHandler<CloneJob, CloneResult>>,
    pub test_execution: Arc<dyn StageHandler<TestExecutionJob, TestExecutionResult>>,
    pub code_analysis: Arc<dyn StageHandler<CodeAnalysisJob, CodeAnalysisResult>>,
    pub gpt_evaluation: Arc<dyn StageHandler<GptEvaluationJob, GptEvaluationResult>>,
    pub report_generation: Arc<dyn StageHandler<ReportGenerationJob, ReportGenerationResult>>,
}

impl std::fmt::Debug for StageHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandlers").finish_non_exhaustive()
    }
}

impl StageHandlers {
    /// The built-in handlers, configured from `config`.
    pub fn defaults(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            clone: Arc::new(GitCloneHandler::new()),
            test_execution: Arc::new(SandboxTestRunner::new(config.sandbox.clone())),
            code_analysis: Arc::new(SourceTreeAnalyzer::new()),
            gpt_evaluation: Arc::new(OpenAiEvaluator::from_config(&config.llm)?),
            report_generation: Arc::new(MarkdownReportWriter::new(
                config.paths.reports_dir.clone(),
            )),
        })
    }

    pub fn with_clone(mut self, h: impl StageHandler<CloneJob, CloneResult> + 'static) -> Self {
        self.clone = Arc::new(h);
        self
    }

    pub fn with_test_execution(
        mut self,
        h: impl StageHandler<TestExecutionJob, TestExecutionResult> + 'static,
    ) -> Self {
        self.test_execution = Arc::new(h);
        self
    }

    pub fn with_code_analysis(
        mut self,
        h: impl StageHandler<CodeAnalysisJob, CodeAnalysisResult> + 'static,
    ) -> Self {
        self.code_analysis = Arc::new(h);
        self
    }

    pub fn with_gpt_evaluation(
        mut self,
        h: impl StageHandler<GptEvaluationJob, GptEvaluationResult> + 'static,
    ) -> Self {
        self.gpt_evaluation = Arc::new(h);
        self
    }

    pub fn with_report_generation(
        mut self,
        h: impl StageHandler<ReportGenerationJob, ReportGenerationResult> + 'static,
    ) -> Self {
        self.report_generation = Arc::new(h);
        self
    }
}
