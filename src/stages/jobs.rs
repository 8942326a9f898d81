//! Payloads and results of the five stage queues.
//!
//! Field names are camelCase on the wire so jobs written by other producers of
//! the same queues deserialize unchanged.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Implemented by every stage result so the queue adapter can reject
/// results that report `success: false`.
pub trait StageOutput {
    fn succeeded(&self) -> bool;
}

macro_rules! stage_output {
    ($($ty:ty),* $(,)?) => {
        $(impl StageOutput for $ty {
            fn succeeded(&self) -> bool {
                self.success
            }
        })*
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneJob {
    pub submission_id: String,
    pub github_repo_url: String,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneResult {
    pub success: bool,
    pub work_dir: PathBuf,
    pub commit_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestExecutionJob {
    pub submission_id: String,
    pub work_dir: PathBuf,
    pub test_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestExecutionResult {
    pub success: bool,
    pub total_tests: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    /// False when a suite could not even be loaded (syntax/compile errors)
    #[serde(default = "default_true")]
    pub build_success: bool,
}

fn default_true() -> bool {
    true
}

impl TestExecutionResult {
    /// Share of passed tests, 0.0 when nothing ran.
    pub fn pass_ratio(&self) -> f64 {
        if self.total_tests == 0 {
            0.0
        } else {
            f64::from(self.passed_tests) / f64::from(self.total_tests)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeAnalysisJob {
    pub submission_id: String,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageStats {
    pub files: usize,
    pub lines: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeMetrics {
    pub total_files: usize,
    pub total_lines: usize,
    pub languages: BTreeMap<String, LanguageStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeAnalysisResult {
    pub success: bool,
    pub summary: String,
    #[serde(default)]
    pub metrics: CodeMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GptEvaluationJob {
    pub submission_id: String,
    pub criterion_id: String,
    pub criterion_title: String,
    pub max_points: f64,
    #[serde(default)]
    pub instructions: Option<String>,
    /// Accumulated output of earlier stages, rendered for the evaluator
    pub context: String,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GptEvaluationResult {
    pub success: bool,
    pub criterion_id: String,
    pub score: f64,
    pub justification: String,
}

/// Score of one rubric criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionScore {
    pub criterion_id: String,
    pub title: String,
    pub score: f64,
    pub max_points: f64,
    #[serde(default)]
    pub justification: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeTotals {
    pub total_score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub letter_grade: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportGenerationJob {
    pub submission_id: String,
    /// Grading job the report belongs to; keeps re-runs of one attempt apart
    pub grading_job_id: Uuid,
    pub attempt_number: u32,
    pub rubric_id: String,
    pub commit_hash: String,
    pub tests: TestExecutionResult,
    pub code_summary: String,
    pub breakdown: Vec<CriterionScore>,
    pub totals: GradeTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportGenerationResult {
    pub success: bool,
    pub report_url: String,
}

stage_output!(
    CloneResult,
    TestExecutionResult,
    CodeAnalysisResult,
    GptEvaluationResult,
    ReportGenerationResult,
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clone_job_uses_camel_case() {
        let job = CloneJob {
            submission_id: "s1".into(),
            github_repo_url: "https://github.com/a/b".into(),
            work_dir: PathBuf::from("/tmp/w"),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(
            value,
            json!({"submissionId": "s1", "githubRepoUrl": "https://github.com/a/b", "workDir": "/tmp/w"})
        );
    }

    #[test]
    fn test_result_without_build_flag_defaults_to_built() {
        let result: TestExecutionResult = serde_json::from_value(json!({
            "success": true, "totalTests": 4, "passedTests": 3, "failedTests": 1
        }))
        .unwrap();
        assert!(result.build_success);
        assert_eq!(result.pass_ratio(), 0.75);
    }

    #[test]
    fn pass_ratio_with_no_tests_is_zero() {
        assert_eq!(TestExecutionResult::default().pass_ratio(), 0.0);
    }

    #[test]
    fn code_analysis_result_tolerates_missing_metrics() {
        let result: CodeAnalysisResult =
            serde_json::from_value(json!({"success": true, "summary": "ok"})).unwrap();
        assert_eq!(result.metrics, CodeMetrics::default());
        assert!(result.succeeded());
    }
}
