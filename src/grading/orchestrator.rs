use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{PipelineError, Result, StageError};
use crate::grading::collaborators::{
    GradeFailure, GradeReport, GradingOutcome, ResultSink, RubricProvider, TestSuiteResolver,
};
use crate::grading::rubric::Rubric;
use crate::grading::scoring;
use crate::grading::state::{evaluation_progress, GradingState};
use crate::grading::workdir::WorkDirectory;
use crate::queue::{JobContext, JobHandle, JobOutcome, JobProcessor, QueueJob, QueueName, QueueRegistry};
use crate::stages::jobs::{
    CloneJob, CloneResult, CodeAnalysisJob, CodeAnalysisResult, GptEvaluationJob,
    GptEvaluationResult, ReportGenerationJob, ReportGenerationResult, TestExecutionJob,
    TestExecutionResult,
};
use crate::stages::Stage;

pub const CANCELLED_MESSAGE: &str = "grading cancelled";

/// A request to grade one submission attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingRequest {
    pub submission_id: String,
    #[serde(default)]
    pub assignment_id: String,
    #[serde(default)]
    pub student_id: String,
    pub github_repo_url: String,
    pub rubric_id: String,
    #[serde(default)]
    pub test_suite_ids: Vec<String>,
    pub attempt_number: u32,
}

impl GradingRequest {
    pub fn validate(&self) -> Result<()> {
        if self.submission_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("submissionId is required".into()));
        }
        if self.github_repo_url.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("githubRepoUrl is required".into()));
        }
        if self.rubric_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("rubricId is required".into()));
        }
        Ok(())
    }
}

/// Why a run ended without a report.
#[derive(Debug, Clone, PartialEq)]
struct StageFailure {
    stage: Stage,
    message: String,
}

impl StageFailure {
    fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

enum RunError {
    /// Nothing ran yet; let the grading queue retry the whole job
    Retry(String),
    /// Terminal; reported as FAILED
    Failed(StageFailure),
}

impl From<StageFailure> for RunError {
    fn from(failure: StageFailure) -> Self {
        RunError::Failed(failure)
    }
}

/// Tracks the state of one run and reports its progress milestones.
struct GradingRun<'a> {
    state: GradingState,
    ctx: &'a JobContext,
}

impl<'a> GradingRun<'a> {
    async fn start(ctx: &'a JobContext) -> GradingRun<'a> {
        let state = GradingState::Accepted;
        ctx.progress(state.progress()).await;
        Self { state, ctx }
    }

    async fn enter(&mut self, next: GradingState) -> std::result::Result<(), StageFailure> {
        if !self.state.can_transition_to(next) {
            return Err(StageFailure::new(
                self.state.stage(),
                format!("illegal grading transition {} -> {}", self.state, next),
            ));
        }
        tracing::info!(from = %self.state, to = %next, "Grading state changed");
        self.state = next;
        self.ctx.progress(next.progress()).await;
        Ok(())
    }

    async fn progress(&self, progress: u8) {
        self.ctx.progress(progress).await;
    }
}

/// Drives grading jobs through the stage queues.
///
/// Registered as the processor of the grading queue: each grading job runs
/// the stages in order, waiting on one stage's result before enqueueing the
/// next, and ends with exactly one call to the [`ResultSink`].
#[derive(Clone)]
pub struct Orchestrator {
    registry: QueueRegistry,
    rubrics: Arc<dyn RubricProvider>,
    test_suites: Arc<dyn TestSuiteResolver>,
    sink: Arc<dyn ResultSink>,
    work_root: PathBuf,
    cancelled: Arc<Mutex<HashSet<Uuid>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("work_root", &self.work_root)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        registry: QueueRegistry,
        rubrics: Arc<dyn RubricProvider>,
        test_suites: Arc<dyn TestSuiteResolver>,
        sink: Arc<dyn ResultSink>,
        work_root: PathBuf,
    ) -> Self {
        Self {
            registry,
            rubrics,
            test_suites,
            sink,
            work_root,
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    /// Accept a grading request. Returns once the grading job is queued.
    ///
    /// Requests are not deduplicated: submitting the same submission and
    /// attempt twice runs the pipeline twice.
    pub async fn submit(&self, request: &GradingRequest) -> Result<JobHandle> {
        request.validate()?;
        let handle = self.registry.queue(QueueName::Grading).enqueue(request).await?;
        tracing::info!(
            submission_id = %request.submission_id,
            grading_job_id = %handle.id(),
            attempt = request.attempt_number,
            "Grading request accepted"
        );
        Ok(handle)
    }

    /// Ask a grading job to stop. Takes effect before its next stage starts;
    /// the job then ends FAILED with "grading cancelled".
    ///
    /// Returns `false` if no such grading job exists or it already finished.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let queue = self.registry.queue(QueueName::Grading);
        if !is_running(queue.get_job(&job_id).await?) {
            tracing::debug!(grading_job_id = %job_id, "Cancellation ignored, job not running");
            return Ok(false);
        }
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.insert(job_id);
        }
        // The run may have ended between the lookup and the insert
        if !is_running(queue.get_job(&job_id).await?) {
            self.forget_cancellation(&job_id);
            return Ok(false);
        }
        tracing::info!(grading_job_id = %job_id, "Grading cancellation requested");
        Ok(true)
    }

    #[cfg(test)]
    fn pending_cancellations(&self) -> usize {
        self.cancelled.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn is_cancelled(&self, job_id: &Uuid) -> bool {
        self.cancelled
            .lock()
            .map(|c| c.contains(job_id))
            .unwrap_or(false)
    }

    fn forget_cancellation(&self, job_id: &Uuid) {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.remove(job_id);
        }
    }

    fn check_cancelled(&self, job_id: &Uuid, stage: Stage) -> std::result::Result<(), StageFailure> {
        if self.is_cancelled(job_id) {
            tracing::info!(stage = %stage, "Grading cancelled");
            Err(StageFailure::new(stage, CANCELLED_MESSAGE))
        } else {
            Ok(())
        }
    }

    async fn run(&self, job: &QueueJob, ctx: JobContext) -> std::result::Result<serde_json::Value, StageError> {
        let request: GradingRequest = match serde_json::from_value(job.payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                let message = format!("malformed grading job: {}", e);
                if let Some(id) = job.payload.get("submissionId").and_then(|v| v.as_str()) {
                    self.report_failure(id, &StageFailure::new(Stage::Accepted, message.clone()))
                        .await;
                }
                return Err(StageError::contract(message));
            }
        };

        let span = tracing::info_span!(
            "grading",
            submission_id = %request.submission_id,
            grading_job_id = %job.id,
            attempt = ctx.attempt()
        );
        self.finish(job.id, &request, &ctx).instrument(span).await
    }

    async fn finish(
        &self,
        job_id: Uuid,
        request: &GradingRequest,
        ctx: &JobContext,
    ) -> std::result::Result<serde_json::Value, StageError> {
        match self.grade(job_id, request, ctx).await {
            Ok(report) => {
                self.forget_cancellation(&job_id);
                if let Err(e) = self.sink.grading_completed(&report).await {
                    tracing::error!(error = %e, "Failed to deliver grading report");
                }
                ctx.progress(GradingState::Complete.progress()).await;
                tracing::info!(
                    percentage = report.percentage,
                    letter_grade = %report.letter_grade,
                    "Grading {}",
                    GradingState::Complete
                );
                serde_json::to_value(GradingOutcome::Completed(report))
                    .map_err(|e| StageError::contract(e.to_string()))
            }
            Err(RunError::Retry(message)) => {
                tracing::warn!(error = %message, "Grading inputs unavailable, will retry");
                Err(StageError::Transient(message))
            }
            Err(RunError::Failed(failure)) => {
                self.forget_cancellation(&job_id);
                self.report_failure(&request.submission_id, &failure).await;
                Err(StageError::permanent(format!(
                    "{} stage failed: {}",
                    failure.stage, failure.message
                )))
            }
        }
    }

    async fn report_failure(&self, submission_id: &str, failure: &StageFailure) {
        tracing::warn!(
            failed_stage = %failure.stage,
            error = %failure.message,
            "Grading {}",
            GradingState::Failed
        );
        let report = GradeFailure {
            submission_id: submission_id.to_string(),
            error_message: failure.message.clone(),
            failed_stage: failure.stage,
        };
        if let Err(e) = self.sink.grading_failed(&report).await {
            tracing::error!(error = %e, "Failed to deliver grading failure");
        }
    }

    /// Inputs that must exist before any stage runs.
    async fn resolve_inputs(
        &self,
        job_id: Uuid,
        request: &GradingRequest,
    ) -> Result<(Rubric, Vec<PathBuf>, WorkDirectory)> {
        let rubric = self.rubrics.load_rubric(&request.rubric_id).await?;
        let test_files = self
            .test_suites
            .resolve_test_files(&request.test_suite_ids)
            .await?;
        let workdir = WorkDirectory::acquire(&self.work_root, &request.submission_id, job_id).await?;
        Ok((rubric, test_files, workdir))
    }

    async fn grade(
        &self,
        job_id: Uuid,
        request: &GradingRequest,
        ctx: &JobContext,
    ) -> std::result::Result<GradeReport, RunError> {
        let mut run = GradingRun::start(ctx).await;
        self.check_cancelled(&job_id, Stage::Accepted)?;

        let (rubric, test_files, workdir) = match self.resolve_inputs(job_id, request).await {
            Ok(inputs) => inputs,
            Err(e @ PipelineError::InvalidRequest(_)) => {
                return Err(StageFailure::new(Stage::Accepted, e.to_string()).into());
            }
            Err(e) if ctx.is_final_attempt() => {
                return Err(StageFailure::new(Stage::Accepted, e.to_string()).into());
            }
            Err(e) => return Err(RunError::Retry(e.to_string())),
        };

        run.enter(GradingState::Cloning).await?;
        let clone: CloneResult = self
            .run_stage(
                &job_id,
                Stage::Clone,
                &CloneJob {
                    submission_id: request.submission_id.clone(),
                    github_repo_url: request.github_repo_url.clone(),
                    work_dir: workdir.path().to_path_buf(),
                },
            )
            .await?;

        run.enter(GradingState::Testing).await?;
        let tests: TestExecutionResult = self
            .run_stage(
                &job_id,
                Stage::TestExecution,
                &TestExecutionJob {
                    submission_id: request.submission_id.clone(),
                    work_dir: clone.work_dir.clone(),
                    test_files,
                },
            )
            .await?;

        run.enter(GradingState::Analyzing).await?;
        let analysis: CodeAnalysisResult = self
            .run_stage(
                &job_id,
                Stage::CodeAnalysis,
                &CodeAnalysisJob {
                    submission_id: request.submission_id.clone(),
                    work_dir: clone.work_dir.clone(),
                },
            )
            .await?;

        run.enter(GradingState::Evaluating).await?;
        let context = evaluation_context(&clone, &tests, &analysis);
        let evaluations = self
            .evaluate(&job_id, request, &rubric, &clone, context, &run)
            .await?;

        run.enter(GradingState::Reporting).await?;
        let breakdown = scoring::score_criteria(&rubric, &tests, &evaluations);
        let totals = scoring::totals(&breakdown);
        let report: ReportGenerationResult = self
            .run_stage(
                &job_id,
                Stage::ReportGeneration,
                &ReportGenerationJob {
                    submission_id: request.submission_id.clone(),
                    grading_job_id: job_id,
                    attempt_number: request.attempt_number,
                    rubric_id: rubric.id.clone(),
                    commit_hash: clone.commit_hash.clone(),
                    tests,
                    code_summary: analysis.summary.clone(),
                    breakdown,
                    totals: totals.clone(),
                },
            )
            .await?;

        drop(workdir);
        Ok(GradeReport {
            submission_id: request.submission_id.clone(),
            total_score: totals.total_score,
            max_score: totals.max_score,
            percentage: totals.percentage,
            letter_grade: totals.letter_grade,
            build_success: tests.build_success,
            report_reference: report.report_url,
        })
    }

    /// Enqueue one stage job and wait for its terminal outcome.
    async fn run_stage<J, R>(
        &self,
        job_id: &Uuid,
        stage: Stage,
        payload: &J,
    ) -> std::result::Result<R, StageFailure>
    where
        J: Serialize,
        R: DeserializeOwned,
    {
        self.check_cancelled(job_id, stage)?;
        let Some(queue_name) = stage.queue() else {
            return Err(StageFailure::new(stage, "stage has no queue"));
        };

        let handle = self
            .registry
            .queue(queue_name)
            .enqueue(payload)
            .await
            .map_err(|e| StageFailure::new(stage, e.to_string()))?;
        tracing::debug!(stage = %stage, stage_job_id = %handle.id(), "Stage job enqueued");

        stage_result(stage, handle.outcome().await)
    }

    /// Fan out one evaluation per semantic criterion and wait for all of them.
    async fn evaluate(
        &self,
        job_id: &Uuid,
        request: &GradingRequest,
        rubric: &Rubric,
        clone: &CloneResult,
        context: String,
        run: &GradingRun<'_>,
    ) -> std::result::Result<HashMap<String, GptEvaluationResult>, StageFailure> {
        let stage = Stage::GptEvaluation;
        self.check_cancelled(job_id, stage)?;

        let criteria = rubric.semantic_criteria();
        let queue = self.registry.queue(QueueName::GptEvaluation);
        let mut handles = Vec::with_capacity(criteria.len());
        let mut enqueue_error = None;

        for criterion in &criteria {
            let job = GptEvaluationJob {
                submission_id: request.submission_id.clone(),
                criterion_id: criterion.id.clone(),
                criterion_title: criterion.title.clone(),
                max_points: criterion.max_points,
                instructions: criterion.gpt_instructions.clone(),
                context: with_files_to_analyze(&context, &criterion.files_to_analyze),
                work_dir: clone.work_dir.clone(),
            };
            match queue.enqueue(&job).await {
                Ok(handle) => handles.push((criterion.id.clone(), handle)),
                Err(e) => {
                    enqueue_error = Some(e.to_string());
                    break;
                }
            }
        }

        let total = handles.len();
        tracing::info!(criteria = total, "Evaluations fanned out");

        // Wait for every evaluation, even after one fails, so nothing still
        // reads the work directory once the run ends
        let mut pending: FuturesUnordered<_> = handles
            .into_iter()
            .map(|(criterion_id, handle)| async move { (criterion_id, handle.outcome().await) })
            .collect();

        let mut results = HashMap::with_capacity(total);
        let mut failures: HashMap<String, String> = HashMap::new();
        let mut done = 0;
        while let Some((criterion_id, outcome)) = pending.next().await {
            done += 1;
            match stage_result::<GptEvaluationResult>(stage, outcome) {
                Ok(result) => {
                    results.insert(criterion_id, result);
                }
                Err(failure) => {
                    failures.insert(criterion_id, failure.message);
                }
            }
            run.progress(evaluation_progress(done, total)).await;
        }

        if let Some(error) = enqueue_error {
            return Err(StageFailure::new(stage, error));
        }
        // Report the first failed criterion in rubric order
        if let Some(criterion) = criteria.iter().find(|c| failures.contains_key(&c.id)) {
            let error = failures.remove(&criterion.id).unwrap_or_default();
            return Err(StageFailure::new(
                stage,
                format!("criterion {}: {}", criterion.id, error),
            ));
        }

        Ok(results)
    }
}

fn is_running(job: Option<QueueJob>) -> bool {
    job.is_some_and(|job| !job.status.is_terminal())
}

fn stage_result<R: DeserializeOwned>(
    stage: Stage,
    outcome: JobOutcome,
) -> std::result::Result<R, StageFailure> {
    match outcome {
        JobOutcome::Completed(value) => serde_json::from_value(value)
            .map_err(|e| StageFailure::new(stage, format!("malformed {} result: {}", stage, e))),
        JobOutcome::Failed {
            error,
            attempts_made,
        } => {
            tracing::warn!(stage = %stage, attempts_made, error = %error, "Stage failed");
            Err(StageFailure::new(stage, error))
        }
    }
}

/// What the evaluator knows about the submission from earlier stages.
fn evaluation_context(
    clone: &CloneResult,
    tests: &TestExecutionResult,
    analysis: &CodeAnalysisResult,
) -> String {
    format!(
        "Commit: {}\nTests: {}/{} passed, {} failed, build {}\nCode summary: {}",
        clone.commit_hash,
        tests.passed_tests,
        tests.total_tests,
        tests.failed_tests,
        if tests.build_success { "succeeded" } else { "failed" },
        analysis.summary
    )
}

fn with_files_to_analyze(context: &str, files: &[String]) -> String {
    if files.is_empty() {
        context.to_string()
    } else {
        format!("{}\nFiles to analyze: {}", context, files.join(", "))
    }
}

#[async_trait]
impl JobProcessor for Orchestrator {
    async fn process(
        &self,
        job: &QueueJob,
        ctx: JobContext,
    ) -> std::result::Result<serde_json::Value, StageError> {
        self.run(job, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::grading::collaborators::{
        InMemoryRubricProvider, InMemoryTestSuites, MemoryResultSink,
    };
    use serde_json::json;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            QueueRegistry::in_memory(&PipelineConfig::default()),
            Arc::new(InMemoryRubricProvider::new()),
            Arc::new(InMemoryTestSuites::new()),
            Arc::new(MemoryResultSink::new()),
            std::env::temp_dir(),
        )
    }

    fn request() -> GradingRequest {
        GradingRequest {
            submission_id: "s1".into(),
            assignment_id: "a1".into(),
            student_id: "u1".into(),
            github_repo_url: "https://good/repo".into(),
            rubric_id: "r1".into(),
            test_suite_ids: vec!["t1".into()],
            attempt_number: 1,
        }
    }

    #[test]
    fn request_uses_camel_case_and_defaults() {
        let parsed: GradingRequest = serde_json::from_value(json!({
            "submissionId": "s1",
            "githubRepoUrl": "https://good/repo",
            "rubricId": "r1",
            "attemptNumber": 1
        }))
        .unwrap();
        assert!(parsed.test_suite_ids.is_empty());
        assert!(parsed.assignment_id.is_empty());
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn request_requires_identity_fields() {
        let mut r = request();
        r.submission_id = " ".into();
        assert!(matches!(r.validate(), Err(PipelineError::InvalidRequest(_))));

        let mut r = request();
        r.github_repo_url.clear();
        assert!(r.validate().is_err());
    }

    #[test]
    fn failed_stage_outcome_keeps_error() {
        let failure = stage_result::<CloneResult>(
            Stage::Clone,
            JobOutcome::Failed {
                error: "network down".into(),
                attempts_made: 3,
            },
        )
        .unwrap_err();
        assert_eq!(failure, StageFailure::new(Stage::Clone, "network down"));
    }

    #[test]
    fn malformed_stage_result_is_a_failure() {
        let failure = stage_result::<CloneResult>(Stage::Clone, JobOutcome::Completed(json!({"x": 1})))
            .unwrap_err();
        assert!(failure.message.starts_with("malformed clone result"));
    }

    #[test]
    fn context_lists_prior_results() {
        let context = evaluation_context(
            &CloneResult {
                success: true,
                work_dir: PathBuf::from("/w"),
                commit_hash: "abc".into(),
            },
            &TestExecutionResult {
                success: true,
                total_tests: 2,
                passed_tests: 1,
                failed_tests: 1,
                build_success: true,
            },
            &CodeAnalysisResult {
                success: true,
                summary: "tiny".into(),
                metrics: Default::default(),
            },
        );
        assert!(context.contains("Commit: abc"));
        assert!(context.contains("Tests: 1/2 passed"));
        let with_files = with_files_to_analyze(&context, &["src/app.js".to_string()]);
        assert!(with_files.ends_with("Files to analyze: src/app.js"));
    }

    #[tokio::test]
    async fn cancel_records_waiting_jobs() {
        let orchestrator = orchestrator();
        let handle = orchestrator.submit(&request()).await.unwrap();

        assert!(orchestrator.cancel(handle.id()).await.unwrap());
        assert!(orchestrator.is_cancelled(&handle.id()));
    }

    #[tokio::test]
    async fn cancel_ignores_unknown_jobs() {
        let orchestrator = orchestrator();

        assert!(!orchestrator.cancel(Uuid::new_v4()).await.unwrap());
        assert_eq!(orchestrator.pending_cancellations(), 0);
    }

    #[tokio::test]
    async fn cancel_ignores_finished_jobs() {
        let orchestrator = orchestrator();
        let queue = orchestrator.registry().queue(QueueName::Grading);
        let handle = orchestrator.submit(&request()).await.unwrap();
        let mut job = queue.get_job(&handle.id()).await.unwrap().unwrap();
        job.mark_completed(json!({"status": "completed"}));
        queue.store().save(&job).await.unwrap();

        assert!(!orchestrator.cancel(handle.id()).await.unwrap());
        assert_eq!(orchestrator.pending_cancellations(), 0);
    }
}
