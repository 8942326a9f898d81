use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::grading::{
    DirectoryTestSuiteResolver, FileRubricProvider, GradingRequest, LogResultSink, Orchestrator,
    ResultSink, RubricProvider, TestSuiteResolver,
};
use crate::queue::{spawn_maintenance, JobHandle, QueueName, QueueRegistry};
use crate::stages::{Stage, StageHandlers, StageProcessor};
use crate::telemetry::spawn_event_logger;

/// The assembled grading pipeline: queues, stage handlers and orchestrator.
pub struct Pipeline {
    config: PipelineConfig,
    registry: QueueRegistry,
    handlers: StageHandlers,
    orchestrator: Orchestrator,
    dashboard_addr: Option<SocketAddr>,
}

/// Builds a [`Pipeline`]. Anything not supplied falls back to the
/// config-driven default.
pub struct PipelineBuilder {
    config: PipelineConfig,
    registry: Option<QueueRegistry>,
    handlers: Option<StageHandlers>,
    rubrics: Option<Arc<dyn RubricProvider>>,
    test_suites: Option<Arc<dyn TestSuiteResolver>>,
    sink: Option<Arc<dyn ResultSink>>,
    dashboard_addr: Option<SocketAddr>,
}

impl PipelineBuilder {
    pub fn registry(mut self, registry: QueueRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn handlers(mut self, handlers: StageHandlers) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn rubrics(mut self, rubrics: Arc<dyn RubricProvider>) -> Self {
        self.rubrics = Some(rubrics);
        self
    }

    pub fn test_suites(mut self, test_suites: Arc<dyn TestSuiteResolver>) -> Self {
        self.test_suites = Some(test_suites);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub async fn build(self) -> Result<Pipeline> {
        let config = self.config;
        let registry = match self.registry {
            Some(registry) => registry,
            None => QueueRegistry::from_config(&config).await?,
        };
        let handlers = match self.handlers {
            Some(handlers) => handlers,
            None => StageHandlers::defaults(&config)?,
        };
        let rubrics = self
            .rubrics
            .unwrap_or_else(|| Arc::new(FileRubricProvider::new(config.paths.rubrics_dir.clone())));
        let test_suites = self.test_suites.unwrap_or_else(|| {
            Arc::new(DirectoryTestSuiteResolver::new(
                config.paths.test_suites_dir.clone(),
            ))
        });
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogResultSink));

        let orchestrator = Orchestrator::new(
            registry.clone(),
            rubrics,
            test_suites,
            sink,
            config.paths.work_root.clone(),
        );

        Ok(Pipeline {
            config,
            registry,
            handlers,
            orchestrator,
            dashboard_addr: self.dashboard_addr,
        })
    }
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            registry: None,
            handlers: None,
            rubrics: None,
            test_suites: None,
            sink: None,
            dashboard_addr: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Accept a grading request; see [`Orchestrator::submit`].
    pub async fn submit(&self, request: &GradingRequest) -> Result<JobHandle> {
        self.orchestrator.submit(request).await
    }

    /// Cancel a running grading job; see [`Orchestrator::cancel`].
    pub async fn cancel(&self, grading_job_id: Uuid) -> Result<bool> {
        self.orchestrator.cancel(grading_job_id).await
    }

    /// Start every subsystem:
    /// 1. Workers for the five stage queues, each with its configured concurrency
    /// 2. Workers for the grading queue, running the orchestrator
    /// 3. The queue event logger
    /// 4. Periodic maintenance (retention, stalled jobs, overdue retries)
    /// 5. The dashboard, if an address was configured
    ///
    /// Cancelling `shutdown` stops the grading queue first. In-flight grading
    /// runs still need their stage jobs, so the stage queues, logger and
    /// maintenance keep going until the grading workers have drained.
    /// [`PipelineWorkers::join`] waits for all of it.
    pub fn start(&self, shutdown: CancellationToken) -> PipelineWorkers {
        let workers = &self.config.workers;
        let h = &self.handlers;
        let stages = CancellationToken::new();
        let mut tasks = Vec::with_capacity(9);

        tasks.push(self.registry.queue(QueueName::GitClone).process(
            workers.concurrency_for(QueueName::GitClone),
            StageProcessor::new(Stage::Clone, h.clone.clone()),
            stages.clone(),
        ));
        tasks.push(self.registry.queue(QueueName::TestExecution).process(
            workers.concurrency_for(QueueName::TestExecution),
            StageProcessor::new(Stage::TestExecution, h.test_execution.clone()),
            stages.clone(),
        ));
        tasks.push(self.registry.queue(QueueName::CodeAnalysis).process(
            workers.concurrency_for(QueueName::CodeAnalysis),
            StageProcessor::new(Stage::CodeAnalysis, h.code_analysis.clone()),
            stages.clone(),
        ));
        tasks.push(self.registry.queue(QueueName::GptEvaluation).process(
            workers.concurrency_for(QueueName::GptEvaluation),
            StageProcessor::new(Stage::GptEvaluation, h.gpt_evaluation.clone()),
            stages.clone(),
        ));
        tasks.push(self.registry.queue(QueueName::ReportGeneration).process(
            workers.concurrency_for(QueueName::ReportGeneration),
            StageProcessor::new(Stage::ReportGeneration, h.report_generation.clone()),
            stages.clone(),
        ));

        tasks.push(spawn_event_logger(&self.registry, stages.clone()));
        tasks.push(spawn_maintenance(
            self.registry.clone(),
            &self.config,
            stages.clone(),
        ));

        let grading = self.registry.queue(QueueName::Grading).process(
            workers.concurrency_for(QueueName::Grading),
            self.orchestrator.clone(),
            shutdown.clone(),
        );
        tasks.push(tokio::spawn(stop_stages_after(grading, stages)));

        if let Some(addr) = self.dashboard_addr {
            let state = DashboardState {
                registry: self.registry.clone(),
            };
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                run_dashboard(addr, state, shutdown).await;
            }));
        }

        tracing::info!(
            store = ?self.config.store.backend,
            concurrency = workers.concurrency,
            dashboard_addr = ?self.dashboard_addr,
            "Grading pipeline started"
        );

        PipelineWorkers { tasks, shutdown }
    }
}

/// Wait for the grading workers to drain, then stop everything they depend on.
async fn stop_stages_after(grading: JoinHandle<()>, stages: CancellationToken) {
    if let Err(e) = grading.await {
        tracing::error!(error = %e, "Grading workers panicked");
    }
    tracing::info!("Grading queue drained, stopping stage queues");
    stages.cancel();
}

/// Background tasks of a started [`Pipeline`].
pub struct PipelineWorkers {
    tasks: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl PipelineWorkers {
    /// Cancel everything and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Wait for all tasks to stop (after the shutdown token is cancelled).
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Pipeline task panicked");
            }
        }
        tracing::info!("Grading pipeline stopped");
    }
}
