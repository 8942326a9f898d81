use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// Filesystem area owned by one grading run.
///
/// Lives at `<root>/<submission>/<grading job id>` so concurrent runs, even
/// for the same submission, never share a directory. The directory is removed
/// when the value is dropped, whichever way the run ends.
#[derive(Debug)]
pub struct WorkDirectory {
    path: PathBuf,
    submission_dir: PathBuf,
}

impl WorkDirectory {
    /// Reserve the directory for a run. Only the parent is created: the clone
    /// stage creates the leaf itself.
    pub async fn acquire(root: &Path, submission_id: &str, job_id: Uuid) -> Result<Self> {
        let segment = sanitize(submission_id);
        if segment.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "submission id is empty".to_string(),
            ));
        }

        let submission_dir = root.join(segment);
        tokio::fs::create_dir_all(&submission_dir).await?;
        let path = submission_dir.join(job_id.to_string());

        tracing::debug!(path = %path.display(), "Work directory acquired");
        Ok(Self {
            path,
            submission_dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDirectory {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Work directory removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove work directory");
            }
        }
        // Only succeeds once no other run of this submission is using it
        let _ = std::fs::remove_dir(&self.submission_dir);
    }
}

fn sanitize(id: &str) -> String {
    id.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
