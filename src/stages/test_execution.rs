use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::StageError;
use crate::queue::JobContext;
use crate::stages::jobs::{TestExecutionJob, TestExecutionResult};
use crate::stages::StageHandler;

/// Directory inside the work dir that receives the instructor's test files
pub const TESTS_DIR: &str = "__autograder_tests__";

const CONTAINER_WORKDIR: &str = "/workspace";

/// Summary fields of Jest's `--json` report
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestReport {
    num_total_tests: u32,
    num_passed_tests: u32,
    num_failed_tests: u32,
    #[serde(default)]
    num_runtime_error_test_suites: u32,
}

/// Runs the submission's tests in a sandboxed Docker container.
///
/// The container gets:
/// - No network (unless disabled in config)
/// - Dropped capabilities and no privilege escalation
/// - Read-only root filesystem, writable `/tmp`
/// - Memory and CPU limits
/// - The work directory mounted at `/workspace`
#[derive(Debug, Clone)]
pub struct SandboxTestRunner {
    config: SandboxConfig,
}

impl SandboxTestRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Arguments for `docker` that run the test command against `work_dir`
    /// in a container called `container`.
    pub fn docker_args(&self, container: &str, work_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--name={}", container),
        ];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());
        args.push("--tmpfs=/tmp".to_string());

        args.push(format!(
            "--volume={}:{}",
            work_dir.display(),
            CONTAINER_WORKDIR
        ));
        args.push(format!("--workdir={}", CONTAINER_WORKDIR));

        args.push(self.config.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(self.config.test_command.clone());
        args
    }

    async fn stage_test_files(
        &self,
        work_dir: &Path,
        files: &[PathBuf],
    ) -> Result<(), StageError> {
        let target = work_dir.join(TESTS_DIR);
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| StageError::transient(format!("failed to create tests dir: {}", e)))?;

        for file in files {
            let Some(name) = file.file_name() else {
                return Err(StageError::permanent(format!(
                    "test file has no name: {}",
                    file.display()
                )));
            };
            tokio::fs::copy(file, target.join(name)).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StageError::permanent(format!("test file missing: {}", file.display()))
                } else {
                    StageError::transient(format!("failed to copy {}: {}", file.display(), e))
                }
            })?;
        }
        Ok(())
    }
}

/// Removes a container whose `docker run` was abandoned mid-flight.
///
/// Killing the `docker` CLI does not stop the container, so when an attempt
/// is dropped (stage timeout, shutdown) the container is force-removed.
struct ContainerGuard {
    docker: String,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: &str, name: String) -> Self {
        Self {
            docker: docker.to_string(),
            name,
            armed: true,
        }
    }

    /// The run finished; `--rm` already removed the container.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(container = %self.name, "No runtime to remove abandoned container");
            return;
        };
        let mut cmd = Command::new(&self.docker);
        cmd.args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let name = std::mem::take(&mut self.name);
        runtime.spawn(async move {
            match cmd.status().await {
                Ok(status) if status.success() => {
                    tracing::info!(container = %name, "Removed abandoned test container");
                }
                Ok(status) => {
                    tracing::warn!(container = %name, code = ?status.code(), "Failed to remove test container");
                }
                Err(e) => {
                    tracing::warn!(container = %name, error = %e, "Failed to remove test container");
                }
            }
        });
    }
}

/// Extract the test counts from Jest's JSON output.
///
/// Jest may print log lines before the report, so parsing starts at the
/// first line that opens a JSON object.
pub fn parse_jest_report(stdout: &str) -> Result<TestExecutionResult, StageError> {
    let start = stdout
        .find("\n{")
        .map(|i| i + 1)
        .or_else(|| stdout.starts_with('{').then_some(0))
        .ok_or_else(|| StageError::permanent("test runner produced no JSON report"))?;

    let report: JestReport = serde_json::from_str(stdout[start..].trim())
        .map_err(|e| StageError::permanent(format!("unparseable test report: {}", e)))?;

    Ok(TestExecutionResult {
        success: true,
        total_tests: report.num_total_tests,
        passed_tests: report.num_passed_tests,
        failed_tests: report.num_failed_tests,
        build_success: report.num_runtime_error_test_suites == 0,
    })
}

#[async_trait]
impl StageHandler<TestExecutionJob, TestExecutionResult> for SandboxTestRunner {
    async fn handle(
        &self,
        job: TestExecutionJob,
        ctx: &JobContext,
    ) -> Result<TestExecutionResult, StageError> {
        tracing::info!(
            submission_id = %job.submission_id,
            test_files = job.test_files.len(),
            image = %self.config.image,
            "Running tests"
        );

        self.stage_test_files(&job.work_dir, &job.test_files).await?;
        ctx.progress(20).await;

        let container = format!("autograder-{}-{}", ctx.job_id(), ctx.attempt());
        let mut guard = ContainerGuard::new(&self.config.docker, container.clone());
        let output = Command::new(&self.config.docker)
            .args(self.docker_args(&container, &job.work_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        guard.disarm();
        let output =
            output.map_err(|e| StageError::transient(format!("failed to start sandbox: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        // A failing test suite exits non-zero but still prints a report
        let result = parse_jest_report(&stdout).map_err(|e| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                submission_id = %job.submission_id,
                exit_code = ?output.status.code(),
                stderr = %stderr.chars().take(2000).collect::<String>(),
                "Test run produced no usable report"
            );
            e
        })?;

        tracing::info!(
            submission_id = %job.submission_id,
            total = result.total_tests,
            passed = result.passed_tests,
            failed = result.failed_tests,
            build_success = result.build_success,
            "Tests finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_args_apply_sandbox_limits() {
        let runner = SandboxTestRunner::new(SandboxConfig::default());
        let args = runner.docker_args("autograder-j1-1", Path::new("/work/s1/j1"));

        assert_eq!(&args[..3], &["run", "--rm", "--name=autograder-j1-1"]);
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"--cpus=1.0".to_string()));
        assert!(args.contains(&"--cap-drop=ALL".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"--volume=/work/s1/j1:/workspace".to_string()));
        assert_eq!(args.last().unwrap(), "npx jest --ci --json");
    }

    #[test]
    fn network_can_be_enabled() {
        let runner = SandboxTestRunner::new(SandboxConfig {
            network_disabled: false,
            memory_limit: None,
            ..SandboxConfig::default()
        });
        let args = runner.docker_args("c", Path::new("/w"));
        assert!(!args.iter().any(|a| a.starts_with("--network")));
        assert!(!args.iter().any(|a| a.starts_with("--memory")));
    }

    #[test]
    fn parses_jest_report_after_log_lines() {
        let stdout = "npm notice something\n{\"numTotalTests\":5,\"numPassedTests\":4,\"numFailedTests\":1,\"numRuntimeErrorTestSuites\":0,\"success\":false}";
        let result = parse_jest_report(stdout).unwrap();
        assert_eq!(result.total_tests, 5);
        assert_eq!(result.passed_tests, 4);
        assert_eq!(result.failed_tests, 1);
        assert!(result.build_success);
        assert!(result.success);
    }

    #[test]
    fn runtime_errors_mean_build_failed() {
        let stdout = r#"{"numTotalTests":0,"numPassedTests":0,"numFailedTests":0,"numRuntimeErrorTestSuites":2}"#;
        let result = parse_jest_report(stdout).unwrap();
        assert!(!result.build_success);
    }

    #[test]
    fn garbage_output_is_permanent() {
        let err = parse_jest_report("Segmentation fault").unwrap_err();
        assert!(!err.is_retryable());
        let err = parse_jest_report("{ not json").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn missing_test_file_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SandboxTestRunner::new(SandboxConfig::default());
        let err = runner
            .stage_test_files(dir.path(), &[dir.path().join("nope.test.js")])
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_files_are_copied_into_tests_dir() {
        let dir = tempfile::tempdir().unwrap();
        let suite = dir.path().join("auth.test.js");
        std::fs::write(&suite, "test('x', () => {})").unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();

        SandboxTestRunner::new(SandboxConfig::default())
            .stage_test_files(&work, &[suite])
            .await
            .unwrap();
        assert!(work.join(TESTS_DIR).join("auth.test.js").exists());
    }

    /// A fake `docker` that hangs on `run` and logs any other invocation.
    #[cfg(unix)]
    fn fake_docker(dir: &Path, log: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("docker");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nif [ \"$1\" = run ]; then exec sleep 30; fi\necho \"$@\" >> {}\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abandoned_run_removes_its_container() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("docker.log");
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        let runner = SandboxTestRunner::new(SandboxConfig {
            docker: fake_docker(dir.path(), &log),
            ..SandboxConfig::default()
        });
        let ctx = JobContext::standalone(crate::queue::QueueName::TestExecution);
        let job = TestExecutionJob {
            submission_id: "s1".into(),
            work_dir: work,
            test_files: vec![],
        };

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(300),
            runner.handle(job, &ctx),
        )
        .await;
        assert!(timed_out.is_err());

        let expected = format!("rm -f autograder-{}-1", ctx.job_id());
        let mut logged = String::new();
        for _ in 0..50 {
            logged = std::fs::read_to_string(&log).unwrap_or_default();
            if logged.contains(&expected) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(logged.contains(&expected), "docker calls: {:?}", logged);
    }
}
