//! HTTP surface: start runs, inspect them, answer approvals.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use shipwright_common::ApprovalResponsePayload;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::errors::ApprovalError;
use crate::orchestrator::RunTrigger;
use crate::orchestrator::scheduler::Scheduler;

pub struct AppState {
    pub scheduler: Scheduler,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unprocessable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", e), "request failed");
        ApiError::Internal(format!("{:#}", e))
    }
}

impl From<ApprovalError> for ApiError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::NotFound(_) => ApiError::NotFound(e.to_string()),
            ApprovalError::AlreadyResolved(_) | ApprovalError::TimedOut(_) => ApiError::Conflict(e.to_string()),
            ApprovalError::KindMismatch { .. } | ApprovalError::InvalidResponse { .. } => {
                ApiError::Unprocessable(e.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/runs", get(list_runs).post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/approvals", get(list_approvals))
        .route("/api/approvals/{id}", get(get_approval))
        .route("/api/approvals/{id}/respond", post(respond))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn create_run(
    State(state): State<SharedState>,
    Json(trigger): Json<RunTrigger>,
) -> Result<impl IntoResponse, ApiError> {
    trigger.validate().map_err(ApiError::BadRequest)?;
    let run = state.scheduler.start(trigger).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

async fn list_runs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let runs = state.scheduler.engine().db.call(|db| db.list_runs(100)).await?;
    Ok(Json(runs))
}

async fn get_run(State(state): State<SharedState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let detail = state
        .scheduler
        .engine()
        .db
        .call(move |db| db.run_detail(&lookup))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no run with id {}", id)))?;
    Ok(Json(detail))
}

async fn list_approvals(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let pending = state
        .scheduler
        .engine()
        .db
        .call(|db| db.list_pending_approvals())
        .await?;
    Ok(Json(pending))
}

async fn get_approval(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let approval = state
        .scheduler
        .engine()
        .db
        .call(move |db| db.get_approval(&lookup))
        .await?
        .ok_or(ApprovalError::NotFound(id))?;
    Ok(Json(approval))
}

async fn respond(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(response): Json<ApprovalResponsePayload>,
) -> Result<impl IntoResponse, ApiError> {
    let approval = state.scheduler.respond(&id, response).await??;
    Ok(Json(approval))
}

// ── Serving ───────────────────────────────────────────────────────────

/// Serve until `shutdown` fires, sweeping expired approvals alongside.
pub async fn serve(scheduler: Scheduler, bind: &str, shutdown: CancellationToken) -> Result<()> {
    let resumed = scheduler.resume_orphans().await?;
    if !resumed.is_empty() {
        tracing::info!(count = resumed.len(), "resumed orphaned runs");
    }

    let sweeper = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run_sweeper(shutdown).await })
    };

    let app = build_router(Arc::new(AppState { scheduler }));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    tracing::info!(addr = %listener.local_addr()?, "shipwright listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "sweeper task ended abnormally");
    }
    tracing::info!("server shut down");
    Ok(())
}

/// Cancel `token` on Ctrl+C.
pub async fn cancel_on_ctrl_c(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        return;
    }
    tracing::info!("shutting down");
    token.cancel();
}
