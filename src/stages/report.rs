use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::StageError;
use crate::queue::JobContext;
use crate::stages::jobs::{ReportGenerationJob, ReportGenerationResult};
use crate::stages::StageHandler;

/// Writes the grading report as markdown under `reports_dir` and returns a
/// `file://` locator for it.
#[derive(Debug, Clone)]
pub struct MarkdownReportWriter {
    reports_dir: PathBuf,
}

impl MarkdownReportWriter {
    pub fn new(reports_dir: PathBuf) -> Self {
        Self { reports_dir }
    }

    /// `<reports_dir>/<submission>/attempt-<n>-<grading job id>.md`
    pub fn report_path(&self, job: &ReportGenerationJob) -> PathBuf {
        self.reports_dir
            .join(sanitize(&job.submission_id))
            .join(format!(
                "attempt-{}-{}.md",
                job.attempt_number, job.grading_job_id
            ))
    }
}

/// Keep ids from escaping the reports directory.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Render the report body.
pub fn render_report(job: &ReportGenerationJob) -> String {
    let mut out = String::new();
    let totals = &job.totals;

    let _ = writeln!(out, "# Grading report: submission {}", job.submission_id);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Attempt: {}", job.attempt_number);
    let _ = writeln!(out, "- Rubric: {}", job.rubric_id);
    let _ = writeln!(out, "- Commit: `{}`", job.commit_hash);
    let _ = writeln!(
        out,
        "- Score: **{:.2} / {:.2}** ({:.2}%), grade **{}**",
        totals.total_score, totals.max_score, totals.percentage, totals.letter_grade
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "## Tests");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{} passed, {} failed, {} total. Build {}.",
        job.tests.passed_tests,
        job.tests.failed_tests,
        job.tests.total_tests,
        if job.tests.build_success { "succeeded" } else { "failed" }
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "## Criteria");
    let _ = writeln!(out);
    let _ = writeln!(out, "| Criterion | Score | Max |");
    let _ = writeln!(out, "|---|---:|---:|");
    for c in &job.breakdown {
        let _ = writeln!(out, "| {} | {:.2} | {:.2} |", c.title, c.score, c.max_points);
    }
    let _ = writeln!(out);

    let justified: Vec<_> = job
        .breakdown
        .iter()
        .filter_map(|c| c.justification.as_deref().map(|j| (c, j)))
        .collect();
    if !justified.is_empty() {
        let _ = writeln!(out, "## Feedback");
        let _ = writeln!(out);
        for (c, justification) in justified {
            let _ = writeln!(out, "### {}", c.title);
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", justification);
            let _ = writeln!(out);
        }
    }

    let _ = writeln!(out, "## Code summary");
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", job.code_summary);
    out
}

#[async_trait]
impl StageHandler<ReportGenerationJob, ReportGenerationResult> for MarkdownReportWriter {
    async fn handle(
        &self,
        job: ReportGenerationJob,
        ctx: &JobContext,
    ) -> Result<ReportGenerationResult, StageError> {
        let path = self.report_path(&job);
        tracing::info!(
            submission_id = %job.submission_id,
            path = %path.display(),
            "Writing grading report"
        );

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StageError::transient(format!("failed to create report dir: {}", e)))?;
        }
        tokio::fs::write(&path, render_report(&job))
            .await
            .map_err(|e| StageError::transient(format!("failed to write report: {}", e)))?;
        let absolute = tokio::fs::canonicalize(&path)
            .await
            .map_err(|e| StageError::transient(format!("failed to resolve report path: {}", e)))?;
        ctx.progress(100).await;

        Ok(ReportGenerationResult {
            success: true,
            report_url: file_url(&absolute),
        })
    }
}
