use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::queue::{JobStatus, QueueCounts, QueueJob, QueueName, QueueRegistry};

#[derive(Clone)]
pub struct DashboardState {
    pub registry: QueueRegistry,
}

#[derive(Serialize)]
struct QueueSummary {
    name: QueueName,
    counts: QueueCounts,
}

#[derive(Serialize)]
struct JobResponse {
    id: String,
    status: JobStatus,
    attempts_made: u32,
    max_attempts: u32,
    progress: u8,
    payload: serde_json::Value,
    failed_reason: Option<String>,
    return_value: Option<serde_json::Value>,
    created_at: String,
    finished_at: Option<String>,
}

impl From<QueueJob> for JobResponse {
    fn from(job: QueueJob) -> Self {
        Self {
            id: job.id.to_string(),
            status: job.status,
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            progress: job.progress,
            payload: job.payload,
            failed_reason: job.failed_reason,
            return_value: job.return_value,
            created_at: job.created_at.to_rfc3339(),
            finished_at: job.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Deserialize)]
struct JobsQuery {
    status: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Read-only queue inspection API.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/queues", get(list_queues_handler))
        .route("/api/queues/:name/jobs", get(list_jobs_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_queues_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let mut queues = Vec::with_capacity(QueueName::ALL.len());
    for queue in state.registry.iter() {
        match queue.counts().await {
            Ok(counts) => queues.push(QueueSummary {
                name: queue.name(),
                counts,
            }),
            Err(e) => {
                return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        }
    }
    Json(queues).into_response()
}

async fn list_jobs_handler(
    State(state): State<DashboardState>,
    Path(name): Path<String>,
    Query(query): Query<JobsQuery>,
) -> impl IntoResponse {
    let Some(name) = QueueName::parse(&name) else {
        return error(StatusCode::NOT_FOUND, format!("unknown queue: {}", name)).into_response();
    };
    let status = match query.status.as_deref() {
        None => None,
        Some(s) => match JobStatus::parse(s) {
            Some(status) => Some(status),
            None => {
                return error(StatusCode::BAD_REQUEST, format!("unknown status: {}", s))
                    .into_response();
            }
        },
    };

    match state.registry.queue(name).jobs(status).await {
        Ok(jobs) => {
            let jobs: Vec<JobResponse> = jobs.into_iter().map(JobResponse::from).collect();
            Json(jobs).into_response()
        }
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
