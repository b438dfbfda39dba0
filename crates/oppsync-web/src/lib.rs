//! JSON HTTP surface for triggering syncs and reading the run log.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use oppsync_core::{SyncParams, SyncType};
use oppsync_storage::SyncRunStore;
use oppsync_sync::SyncOrchestrator;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppsync-web";

const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub runs: Arc<dyn SyncRunStore>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        let runs = orchestrator.runs();
        Self { orchestrator, runs }
    }
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/sync/runs", get(runs_handler))
        .route("/api/sync/runs/{id}", get(run_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "could not install ctrl-c handler");
    }
}

async fn health_handler() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Json(mut params): Json<SyncParams>,
) -> Response {
    params.sync_type = SyncType::Api;
    match state.orchestrator.run_sync(params).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => {
            error!(error = %err, "sync request could not start");
            error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUNS_LIMIT)
        .clamp(1, MAX_RUNS_LIMIT);
    match state.runs.get_recent(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn run_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, format!("malformed run id: {id}"));
    };
    match state.runs.get_by_id(id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("sync run {id} not found")),
        Err(err) => server_error(err),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "run log query failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
}
