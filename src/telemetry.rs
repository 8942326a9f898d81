//! Logging setup and the queue event logger.

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::queue::{QueueEvent, QueueEventKind, QueueRegistry};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Calling this twice is harmless:
/// the second subscriber is ignored.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Log every queue event until `shutdown`.
pub fn spawn_event_logger(registry: &QueueRegistry, shutdown: CancellationToken) -> JoinHandle<()> {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &QueueEvent) {
    let queue = event.queue.as_str();
    let job_id = event.job_id.map(|id| id.to_string()).unwrap_or_default();

    match &event.kind {
        QueueEventKind::Waiting => {
            tracing::debug!(queue, job_id = %job_id, "Job waiting");
        }
        QueueEventKind::Active { attempt } => {
            tracing::debug!(queue, job_id = %job_id, attempt, "Job active");
        }
        QueueEventKind::Progress { progress } => {
            tracing::info!(queue, job_id = %job_id, progress, "Job progress");
        }
        QueueEventKind::Completed { attempts_made } => {
            tracing::info!(queue, job_id = %job_id, attempts_made, "Job completed");
        }
        QueueEventKind::Retrying {
            attempt,
            delay,
            error,
        } => {
            tracing::warn!(
                queue,
                job_id = %job_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Job failed, retrying"
            );
        }
        QueueEventKind::Failed {
            attempts_made,
            error,
        } => {
            tracing::error!(queue, job_id = %job_id, attempts_made, error = %error, "Job failed");
        }
        QueueEventKind::Stalled { requeued } => {
            tracing::warn!(queue, job_id = %job_id, requeued, "Job stalled");
        }
        QueueEventKind::Cleaned { removed } => {
            tracing::info!(queue, removed, "Queue cleaned");
        }
    }
}
