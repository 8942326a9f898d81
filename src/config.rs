use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::queue::QueueName;

/// Which job store backs the queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

/// Connection settings for the queue backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Prefix for every key written to the backing store
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            key_prefix: "autograder".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}:{}/", password, self.host, self.port)
            }
            _ => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Default concurrency for every queue
    pub concurrency: usize,
    /// Per-queue concurrency, keyed by queue name (e.g. "gpt-evaluation")
    pub overrides: HashMap<String, usize>,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Active jobs without a heartbeat for this long are considered stalled
    pub stalled_timeout_ms: u64,
    pub maintenance_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            overrides: HashMap::new(),
            poll_interval_ms: 500,
            heartbeat_interval_ms: 1000,
            stalled_timeout_ms: 30_000,
            maintenance_interval_ms: 60_000,
        }
    }
}

impl WorkerConfig {
    pub fn concurrency_for(&self, queue: QueueName) -> usize {
        self.overrides
            .get(queue.as_str())
            .copied()
            .unwrap_or(self.concurrency)
            .max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stalled_timeout(&self) -> Duration {
        Duration::from_millis(self.stalled_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

/// Retry policy shared by all queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub backoff: BackoffKind,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffKind::Exponential,
            delay_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts have already been made.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let base = Duration::from_millis(self.delay_ms);
        match self.backoff {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(16);
                base.saturating_mul(2u32.pow(exponent))
            }
        }
    }
}

/// How long finished jobs stay inspectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub completed_age_secs: u64,
    pub completed_count: usize,
    pub failed_age_secs: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_age_secs: 86_400,
            completed_count: 1000,
            failed_age_secs: 604_800,
        }
    }
}

impl RetentionPolicy {
    pub fn completed_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.completed_age_secs as i64)
    }

    pub fn failed_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.failed_age_secs as i64)
    }
}

/// Wall-clock limits per stage attempt, in seconds. Zero disables the limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub clone_secs: u64,
    pub test_execution_secs: u64,
    pub code_analysis_secs: u64,
    pub gpt_evaluation_secs: u64,
    pub report_generation_secs: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            clone_secs: 300,
            test_execution_secs: 900,
            code_analysis_secs: 300,
            gpt_evaluation_secs: 120,
            report_generation_secs: 120,
        }
    }
}

impl StageTimeouts {
    /// No limits at all; handy when handlers are in-process fakes.
    pub fn disabled() -> Self {
        Self {
            clone_secs: 0,
            test_execution_secs: 0,
            code_analysis_secs: 0,
            gpt_evaluation_secs: 0,
            report_generation_secs: 0,
        }
    }

    pub fn for_queue(&self, queue: QueueName) -> Option<Duration> {
        let secs = match queue {
            // The grading job spends its life waiting on sub-jobs
            QueueName::Grading => 0,
            QueueName::GitClone => self.clone_secs,
            QueueName::TestExecution => self.test_execution_secs,
            QueueName::CodeAnalysis => self.code_analysis_secs,
            QueueName::GptEvaluation => self.gpt_evaluation_secs,
            QueueName::ReportGeneration => self.report_generation_secs,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root under which per-submission work directories are created
    pub work_root: PathBuf,
    pub reports_dir: PathBuf,
    pub rubrics_dir: PathBuf,
    pub test_suites_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("autograder").join("work"),
            reports_dir: PathBuf::from("reports"),
            rubrics_dir: PathBuf::from("rubrics"),
            test_suites_dir: PathBuf::from("test-suites"),
        }
    }
}

/// Configuration for the Docker sandbox that runs student test suites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Docker CLI binary
    pub docker: String,
    /// Docker image to run the tests in
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "512m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "1.0")
    pub cpu_limit: Option<String>,
    /// Shell command run inside the mounted work directory; must print Jest JSON
    pub test_command: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            image: "node:20-alpine".to_string(),
            network_disabled: true,
            memory_limit: Some("512m".to_string()),
            cpu_limit: Some("1.0".to_string()),
            test_command: "npx jest --ci --json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub workers: WorkerConfig,
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
    pub timeouts: StageTimeouts,
    pub paths: PathsConfig,
    pub sandbox: SandboxConfig,
    pub llm: LlmConfig,
    pub log: LogConfig,
}

impl PipelineConfig {
    /// Load from `autograder.toml` (optional) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load with an explicit config file layered over `autograder.toml`.
    ///
    /// Precedence, lowest first: defaults, `autograder.toml`, `file`,
    /// `AUTOGRADER__SECTION__KEY` variables, then the legacy names
    /// (`REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`, `CONCURRENT_JOBS`,
    /// `OPENAI_API_KEY`, `RUST_LOG`).
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(File::with_name("autograder").required(false));

        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let builder = builder
            .add_source(
                Environment::with_prefix("AUTOGRADER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("store.host", std::env::var("REDIS_HOST").ok())?
            .set_override_option("store.port", std::env::var("REDIS_PORT").ok())?
            .set_override_option("store.password", std::env::var("REDIS_PASSWORD").ok())?
            .set_override_option("workers.concurrency", std::env::var("CONCURRENT_JOBS").ok())?
            .set_override_option("llm.api_key", std::env::var("OPENAI_API_KEY").ok())?
            .set_override_option("log.level", std::env::var("RUST_LOG").ok())?;

        let config: PipelineConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.workers.concurrency = concurrency;
        self
    }

    pub fn with_queue_concurrency(mut self, queue: QueueName, concurrency: usize) -> Self {
        self.workers
            .overrides
            .insert(queue.as_str().to_string(), concurrency);
        self
    }

    pub fn with_work_root(mut self, work_root: PathBuf) -> Self {
        self.paths.work_root = work_root;
        self
    }
}
