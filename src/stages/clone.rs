use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::StageError;
use crate::queue::JobContext;
use crate::stages::jobs::{CloneJob, CloneResult};
use crate::stages::StageHandler;

/// git stderr fragments that mean another attempt won't help
const PERMANENT_GIT_ERRORS: &[&str] = &[
    "repository not found",
    "does not exist",
    "authentication failed",
    "could not read username",
    "permission denied (publickey)",
    "not a git repository",
];

/// Shallow-clones the submission repository with the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitCloneHandler {
    git: String,
}

impl Default for GitCloneHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCloneHandler {
    pub fn new() -> Self {
        Self {
            git: "git".to_string(),
        }
    }

    /// Use a specific git binary.
    pub fn with_git(git: impl Into<String>) -> Self {
        Self { git: git.into() }
    }

    async fn git(&self, args: &[&str], cwd: Option<&Path>) -> Result<String, StageError> {
        let mut cmd = Command::new(&self.git);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| StageError::transient(format!("failed to run git: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify_git_failure(&stderr, output.status.code()))
        }
    }
}

/// Accept https/ssh style git URLs only.
pub fn validate_repo_url(url: &str) -> Result<(), StageError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(StageError::permanent("repository URL is empty"));
    }
    if url.chars().any(char::is_whitespace) || url.starts_with('-') {
        return Err(StageError::permanent(format!(
            "invalid repository URL: {}",
            url
        )));
    }

    let scheme_ok = ["https://", "http://", "ssh://", "git://"]
        .iter()
        .any(|scheme| url.starts_with(scheme) && url.len() > scheme.len());
    let scp_ok = url.starts_with("git@") && url.contains(':');
    if scheme_ok || scp_ok {
        Ok(())
    } else {
        Err(StageError::permanent(format!(
            "unsupported repository URL: {}",
            url
        )))
    }
}

fn classify_git_failure(stderr: &str, code: Option<i32>) -> StageError {
    let lower = stderr.to_lowercase();
    let message = if stderr.is_empty() {
        format!("git exited with code {:?}", code)
    } else {
        format!("git failed: {}", stderr)
    };
    if PERMANENT_GIT_ERRORS.iter().any(|p| lower.contains(p)) {
        StageError::Permanent(message)
    } else {
        StageError::Transient(message)
    }
}

#[async_trait]
impl StageHandler<CloneJob, CloneResult> for GitCloneHandler {
    async fn handle(&self, job: CloneJob, ctx: &JobContext) -> Result<CloneResult, StageError> {
        validate_repo_url(&job.github_repo_url)?;
        tracing::info!(
            submission_id = %job.submission_id,
            repo = %job.github_repo_url,
            work_dir = %job.work_dir.display(),
            "Cloning repository"
        );

        // A previous attempt may have left a partial checkout behind
        if tokio::fs::try_exists(&job.work_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&job.work_dir)
                .await
                .map_err(|e| StageError::transient(format!("failed to clear work dir: {}", e)))?;
        }
        if let Some(parent) = job.work_dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StageError::transient(format!("failed to create work dir: {}", e)))?;
        }

        let target = job.work_dir.to_string_lossy().to_string();
        self.git(
            &["clone", "--depth", "1", "--", job.github_repo_url.trim(), &target],
            None,
        )
        .await?;
        ctx.progress(80).await;

        let commit_hash = self.git(&["rev-parse", "HEAD"], Some(&job.work_dir)).await?;
        tracing::debug!(submission_id = %job.submission_id, commit = %commit_hash, "Clone finished");

        Ok(CloneResult {
            success: true,
            work_dir: job.work_dir,
            commit_hash,
        })
    }
}
