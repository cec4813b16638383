//! HTTP transport for events and status.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use issue_worker_common::{EventAck, EventType, JobStatus, WorkerEvent};
use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::WorkerError;
use crate::worker::agent::read_log_tail;
use crate::worker::supervisor::JobSupervisor;

const DEFAULT_LOG_LINES: usize = 200;
const MAX_LOG_LINES: usize = 5000;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub supervisor: JobSupervisor,
}

pub type SharedState = Arc<AppState>;

#[derive(Deserialize)]
pub struct LogQuery {
    pub lines: Option<usize>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl From<WorkerError> for ApiError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::EventRejected { .. } => ApiError::Conflict(err.to_string()),
            WorkerError::Configuration(_) => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/logs", get(logs))
        .route("/event", post(event))
        .route("/stop", post(stop))
        .route("/cleanup", post(cleanup))
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn status(State(state): State<SharedState>) -> Json<JobStatus> {
    Json(state.supervisor.status())
}

async fn logs(
    State(state): State<SharedState>,
    Query(query): Query<LogQuery>,
) -> Result<String, ApiError> {
    let Some(path) = state.supervisor.log_path() else {
        return Ok(String::new());
    };
    let lines = query
        .lines
        .unwrap_or(DEFAULT_LOG_LINES)
        .clamp(1, MAX_LOG_LINES);
    match read_log_tail(&path, lines).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(ApiError::Internal(format!("cannot read run log: {}", e))),
    }
}

async fn event(
    State(state): State<SharedState>,
    Json(event): Json<WorkerEvent>,
) -> Result<(StatusCode, Json<EventAck>), ApiError> {
    info!(event = %event.event_type, "event received");
    let ack = state.supervisor.handle(event).await.map_err(rejected)?;
    Ok((ack_status(&ack), Json(ack)))
}

async fn stop(State(state): State<SharedState>) -> Result<Json<EventAck>, ApiError> {
    Ok(Json(state.supervisor.stop().await.map_err(rejected)?))
}

async fn cleanup(State(state): State<SharedState>) -> Result<Json<EventAck>, ApiError> {
    let ack = state
        .supervisor
        .handle(WorkerEvent::new(EventType::Cleanup))
        .await
        .map_err(rejected)?;
    Ok(Json(ack))
}

fn rejected(err: WorkerError) -> ApiError {
    warn!(error = %err, "event not applied");
    ApiError::from(err)
}

/// Jobs run in the background, so an accepted start or rerun is 202.
fn ack_status(ack: &EventAck) -> StatusCode {
    match ack.event {
        EventType::Start | EventType::Rerun if ack.accepted => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    }
}

/// Serve until ctrl-c or SIGTERM, then stop any active job.
pub async fn serve(supervisor: JobSupervisor, addr: SocketAddr) -> Result<()> {
    let state = Arc::new(AppState {
        supervisor: supervisor.clone(),
    });
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, "issue worker listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    supervisor.shutdown().await;
    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
}
