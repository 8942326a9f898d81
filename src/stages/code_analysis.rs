use std::path::{Component, Path};

use async_trait::async_trait;
use walkdir::{DirEntry, WalkDir};

use crate::error::StageError;
use crate::queue::JobContext;
use crate::stages::jobs::{CodeAnalysisJob, CodeAnalysisResult, CodeMetrics, LanguageStats};
use crate::stages::test_execution::TESTS_DIR;
use crate::stages::StageHandler;

const SKIPPED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "dist",
    "build",
    "coverage",
    ".next",
    "target",
    TESTS_DIR,
];

const FRONTEND_DIRS: &[&str] = &["frontend", "client", "web", "public", "components", "pages"];
const BACKEND_DIRS: &[&str] = &["backend", "server", "api", "routes", "models", "controllers"];

/// Summarizes the source tree of a submission: file and line counts per
/// language, split into frontend and backend where the layout allows.
#[derive(Debug, Clone, Default)]
pub struct SourceTreeAnalyzer;

impl SourceTreeAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Walk `root` and collect metrics. Blocking.
    pub fn analyze(root: &Path) -> Result<TreeSummary, StageError> {
        if !root.is_dir() {
            return Err(StageError::permanent(format!(
                "work directory does not exist: {}",
                root.display()
            )));
        }

        let mut summary = TreeSummary::default();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_skipped(e));

        for entry in walker {
            let entry = entry.map_err(|e| StageError::transient(format!("walk failed: {}", e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(language) = language_of(entry.path()) else {
                continue;
            };
            // Binary or non-UTF-8 files don't count as source
            let Ok(contents) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let lines = contents.lines().filter(|l| !l.trim().is_empty()).count();

            let stats = summary
                .metrics
                .languages
                .entry(language.to_string())
                .or_insert_with(LanguageStats::default);
            stats.files += 1;
            stats.lines += lines;
            summary.metrics.total_files += 1;
            summary.metrics.total_lines += lines;

            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            match area_of(relative) {
                Some(Area::Frontend) => summary.frontend_files += 1,
                Some(Area::Backend) => summary.backend_files += 1,
                None => {}
            }
        }

        Ok(summary)
    }
}

/// Metrics plus the frontend/backend split.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeSummary {
    pub metrics: CodeMetrics,
    pub frontend_files: usize,
    pub backend_files: usize,
}

impl TreeSummary {
    pub fn describe(&self) -> String {
        if self.metrics.total_files == 0 {
            return "No source files found".to_string();
        }

        let mut languages: Vec<(&String, &LanguageStats)> = self.metrics.languages.iter().collect();
        languages.sort_by(|a, b| b.1.lines.cmp(&a.1.lines).then_with(|| a.0.cmp(b.0)));
        let languages = languages
            .iter()
            .map(|(name, stats)| format!("{} ({} files, {} lines)", name, stats.files, stats.lines))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "{} source files, {} lines. Languages: {}. Frontend files: {}. Backend files: {}.",
            self.metrics.total_files,
            self.metrics.total_lines,
            languages,
            self.frontend_files,
            self.backend_files
        )
    }
}

enum Area {
    Frontend,
    Backend,
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map_or(false, |name| SKIPPED_DIRS.contains(&name))
}

fn area_of(relative: &Path) -> Option<Area> {
    for component in relative.components() {
        let Component::Normal(name) = component else {
            continue;
        };
        let name = name.to_string_lossy().to_lowercase();
        if FRONTEND_DIRS.contains(&name.as_str()) {
            return Some(Area::Frontend);
        }
        if BACKEND_DIRS.contains(&name.as_str()) {
            return Some(Area::Backend);
        }
    }
    None
}

fn language_of(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let language = match ext.as_str() {
        "js" | "mjs" | "cjs" => "JavaScript",
        "jsx" => "JavaScript (JSX)",
        "ts" | "mts" | "cts" => "TypeScript",
        "tsx" => "TypeScript (TSX)",
        "py" => "Python",
        "java" => "Java",
        "rs" => "Rust",
        "go" => "Go",
        "rb" => "Ruby",
        "php" => "PHP",
        "cs" => "C#",
        "c" | "h" => "C",
        "cpp" | "cc" | "hpp" => "C++",
        "html" | "htm" => "HTML",
        "css" | "scss" | "sass" => "CSS",
        "vue" => "Vue",
        "svelte" => "Svelte",
        "sql" => "SQL",
        _ => return None,
    };
    Some(language)
}

#[async_trait]
impl StageHandler<CodeAnalysisJob, CodeAnalysisResult> for SourceTreeAnalyzer {
    async fn handle(
        &self,
        job: CodeAnalysisJob,
        ctx: &JobContext,
    ) -> Result<CodeAnalysisResult, StageError> {
        tracing::info!(submission_id = %job.submission_id, "Analyzing code");

        let root = job.work_dir.clone();
        let summary = tokio::task::spawn_blocking(move || Self::analyze(&root))
            .await
            .map_err(|e| StageError::transient(format!("analysis task failed: {}", e)))??;
        ctx.progress(90).await;

        tracing::debug!(
            submission_id = %job.submission_id,
            files = summary.metrics.total_files,
            lines = summary.metrics.total_lines,
            "Code analysis finished"
        );

        Ok(CodeAnalysisResult {
            success: true,
            summary: summary.describe(),
            metrics: summary.metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn counts_languages_and_skips_vendored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "backend/server.js", "const a = 1;\n\nmodule.exports = a;\n");
        write(root, "frontend/src/App.jsx", "export default () => null;\n");
        write(root, "frontend/src/util.ts", "export const x = 1;\nexport const y = 2;\n");
        write(root, "node_modules/lib/index.js", "ignored();\n");
        write(root, ".git/config", "[core]\n");
        write(root, "README.md", "# readme\n");

        let summary = SourceTreeAnalyzer::analyze(root).unwrap();
        assert_eq!(summary.metrics.total_files, 3);
        assert_eq!(summary.metrics.total_lines, 5);
        assert_eq!(summary.metrics.languages["JavaScript"].lines, 2);
        assert_eq!(summary.metrics.languages["TypeScript"].files, 1);
        assert_eq!(summary.frontend_files, 2);
        assert_eq!(summary.backend_files, 1);
        assert!(summary.describe().starts_with("3 source files, 5 lines."));
    }

    #[test]
    fn missing_work_dir_is_permanent() {
        let err = SourceTreeAnalyzer::analyze(Path::new("/definitely/not/here")).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn empty_tree_has_a_summary() {
        let dir = tempfile::tempdir().unwrap();
        let summary = SourceTreeAnalyzer::analyze(dir.path()).unwrap();
        assert_eq!(summary.describe(), "No source files found");
    }

    #[tokio::test]
    async fn handler_reports_metrics() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.py", "print('hi')\n");
        let result = SourceTreeAnalyzer::new()
            .handle(
                CodeAnalysisJob {
                    submission_id: "s1".into(),
                    work_dir: dir.path().to_path_buf(),
                },
                &JobContext::standalone(crate::queue::QueueName::CodeAnalysis),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.metrics.languages["Python"].files, 1);
    }
}
