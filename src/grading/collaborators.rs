//! Interfaces to the systems around the pipeline: where rubrics and test
//! suites come from, and where grading outcomes go.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use walkdir::WalkDir;

use crate::error::{PipelineError, Result};
use crate::grading::rubric::Rubric;
use crate::stages::Stage;

/// Reported on COMPLETE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeReport {
    pub submission_id: String,
    pub total_score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub letter_grade: String,
    pub build_success: bool,
    pub report_reference: String,
}

/// Reported on FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeFailure {
    pub submission_id: String,
    pub error_message: String,
    pub failed_stage: Stage,
}

/// Terminal outcome of one grading run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GradingOutcome {
    Completed(GradeReport),
    Failed(GradeFailure),
}

impl GradingOutcome {
    pub fn submission_id(&self) -> &str {
        match self {
            GradingOutcome::Completed(r) => &r.submission_id,
            GradingOutcome::Failed(f) => &f.submission_id,
        }
    }
}

#[async_trait]
pub trait RubricProvider: Send + Sync {
    async fn load_rubric(&self, rubric_id: &str) -> Result<Rubric>;
}

#[async_trait]
pub trait TestSuiteResolver: Send + Sync {
    /// Test files of the given suites, in suite order.
    async fn resolve_test_files(&self, suite_ids: &[String]) -> Result<Vec<PathBuf>>;
}

/// Receives exactly one call per grading run.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn grading_completed(&self, report: &GradeReport) -> Result<()>;
    async fn grading_failed(&self, failure: &GradeFailure) -> Result<()>;
}

fn checked_id<'a>(kind: &str, id: &'a str) -> Result<&'a str> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(id)
    } else {
        Err(PipelineError::InvalidRequest(format!("invalid {} id: {:?}", kind, id)))
    }
}

/// Reads `<dir>/<rubric id>.json`.
#[derive(Debug, Clone)]
pub struct FileRubricProvider {
    dir: PathBuf,
}

impl FileRubricProvider {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl RubricProvider for FileRubricProvider {
    async fn load_rubric(&self, rubric_id: &str) -> Result<Rubric> {
        let path = self.dir.join(format!("{}.json", checked_id("rubric", rubric_id)?));
        let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PipelineError::Collaborator(format!("failed to read rubric {}: {}", path.display(), e))
        })?;
        let rubric: Rubric = serde_json::from_str(&data)?;
        Ok(rubric)
    }
}

/// Rubrics held in memory, keyed by id.
#[derive(Debug, Default)]
pub struct InMemoryRubricProvider {
    rubrics: std::sync::RwLock<HashMap<String, Rubric>>,
}

impl InMemoryRubricProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rubric(self, rubric: Rubric) -> Self {
        self.insert(rubric);
        self
    }

    pub fn insert(&self, rubric: Rubric) {
        if let Ok(mut rubrics) = self.rubrics.write() {
            rubrics.insert(rubric.id.clone(), rubric);
        }
    }
}

#[async_trait]
impl RubricProvider for InMemoryRubricProvider {
    async fn load_rubric(&self, rubric_id: &str) -> Result<Rubric> {
        let rubrics = self
            .rubrics
            .read()
            .map_err(|_| PipelineError::Internal("rubric map poisoned".to_string()))?;
        rubrics
            .get(rubric_id)
            .cloned()
            .ok_or_else(|| PipelineError::Collaborator(format!("rubric not found: {}", rubric_id)))
    }
}

/// Resolves suite `<id>` to every file under `<dir>/<id>/`.
#[derive(Debug, Clone)]
pub struct DirectoryTestSuiteResolver {
    dir: PathBuf,
}

impl DirectoryTestSuiteResolver {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl TestSuiteResolver for DirectoryTestSuiteResolver {
    async fn resolve_test_files(&self, suite_ids: &[String]) -> Result<Vec<PathBuf>> {
        let mut suite_dirs = Vec::with_capacity(suite_ids.len());
        for id in suite_ids {
            suite_dirs.push(self.dir.join(checked_id("test suite", id)?));
        }

        tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for suite_dir in suite_dirs {
                if !suite_dir.is_dir() {
                    return Err(PipelineError::Collaborator(format!(
                        "test suite not found: {}",
                        suite_dir.display()
                    )));
                }
                let mut suite_files: Vec<PathBuf> = WalkDir::new(&suite_dir)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .map(|e| e.into_path())
                    .collect();
                suite_files.sort();
                files.extend(suite_files);
            }
            Ok(files)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("test suite lookup panicked: {}", e)))?
    }
}

/// Fixed suite id to file list mapping.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTestSuites {
    suites: HashMap<String, Vec<PathBuf>>,
}

impl InMemoryTestSuites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_suite(mut self, id: impl Into<String>, files: Vec<PathBuf>) -> Self {
        self.suites.insert(id.into(), files);
        self
    }
}

#[async_trait]
impl TestSuiteResolver for InMemoryTestSuites {
    async fn resolve_test_files(&self, suite_ids: &[String]) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for id in suite_ids {
            let suite = self
                .suites
                .get(id)
                .ok_or_else(|| PipelineError::Collaborator(format!("test suite not found: {}", id)))?;
            files.extend(suite.iter().cloned());
        }
        Ok(files)
    }
}

/// Logs outcomes and drops them.
#[derive(Debug, Clone, Default)]
pub struct LogResultSink;

#[async_trait]
impl ResultSink for LogResultSink {
    async fn grading_completed(&self, report: &GradeReport) -> Result<()> {
        tracing::info!(
            submission_id = %report.submission_id,
            total_score = report.total_score,
            max_score = report.max_score,
            percentage = report.percentage,
            letter_grade = %report.letter_grade,
            build_success = report.build_success,
            report = %report.report_reference,
            "Grading completed"
        );
        Ok(())
    }

    async fn grading_failed(&self, failure: &GradeFailure) -> Result<()> {
        tracing::warn!(
            submission_id = %failure.submission_id,
            failed_stage = %failure.failed_stage,
            error = %failure.error_message,
            "Grading failed"
        );
        Ok(())
    }
}

/// Keeps every outcome in memory.
#[derive(Debug, Default)]
pub struct MemoryResultSink {
    outcomes: Mutex<Vec<GradingOutcome>>,
    changed: Notify,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn outcomes(&self) -> Vec<GradingOutcome> {
        self.outcomes.lock().await.clone()
    }

    /// Wait until at least `count` outcomes have been recorded.
    pub async fn wait_for(&self, count: usize) -> Vec<GradingOutcome> {
        loop {
            let notified = self.changed.notified();
            {
                let outcomes = self.outcomes.lock().await;
                if outcomes.len() >= count {
                    return outcomes.clone();
                }
            }
            notified.await;
        }
    }

    async fn record(&self, outcome: GradingOutcome) {
        self.outcomes.lock().await.push(outcome);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn grading_completed(&self, report: &GradeReport) -> Result<()> {
        self.record(GradingOutcome::Completed(report.clone())).await;
        Ok(())
    }

    async fn grading_failed(&self, failure: &GradeFailure) -> Result<()> {
        self.record(GradingOutcome::Failed(failure.clone())).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn file_rubric_provider_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("r1.json"),
            json!({"id": "r1", "title": "T", "criteria": []}).to_string(),
        )
        .unwrap();

        let provider = FileRubricProvider::new(dir.path().to_path_buf());
        assert_eq!(provider.load_rubric("r1").await.unwrap().id, "r1");
        assert!(matches!(
            provider.load_rubric("missing").await.unwrap_err(),
            PipelineError::Collaborator(_)
        ));
        assert!(matches!(
            provider.load_rubric("../secrets").await.unwrap_err(),
            PipelineError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn directory_resolver_lists_suite_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for (suite, file) in [("t1", "b.test.js"), ("t1", "a.test.js"), ("t2", "c.test.js")] {
            std::fs::create_dir_all(dir.path().join(suite)).unwrap();
            std::fs::write(dir.path().join(suite).join(file), "").unwrap();
        }

        let resolver = DirectoryTestSuiteResolver::new(dir.path().to_path_buf());
        let files = resolver
            .resolve_test_files(&["t2".to_string(), "t1".to_string()])
            .await
            .unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["c.test.js", "a.test.js", "b.test.js"]);

        assert!(resolver.resolve_test_files(&["nope".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn memory_sink_waits_for_outcomes() {
        let sink = std::sync::Arc::new(MemoryResultSink::new());
        let waiter = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.wait_for(1).await })
        };

        sink.grading_failed(&GradeFailure {
            submission_id: "s1".into(),
            error_message: "boom".into(),
            failed_stage: Stage::Clone,
        })
        .await
        .unwrap();

        let outcomes = waiter.await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].submission_id(), "s1");
    }

    #[test]
    fn failure_serializes_stage_name() {
        let failure = GradeFailure {
            submission_id: "s1".into(),
            error_message: "boom".into(),
            failed_stage: Stage::Clone,
        };
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value, json!({"submissionId": "s1", "errorMessage": "boom", "failedStage": "clone"}));
    }
}
