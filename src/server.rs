//! HTTP surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tenants/{tenant}/ask` | Answer a question (`{"question": "..."}`) |
//! | `POST` | `/tenants/{tenant}/rebuild` | Start a rebuild; `?reset=true` wipes first |
//! | `POST` | `/tenants/{tenant}/cancel` | Stop the running rebuild (409 when none runs) |
//! | `GET`  | `/tenants/{tenant}/status` | Indexing status |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_ready", "message": "Processing 10 documents...", "state": "INDEXING", "progress": 40 } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_ready` (409),
//! `already_running` (409), `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use groundwork_core::answer::StructuredAnswer;
use groundwork_core::models::{IndexingState, IndexingStatus};

use crate::assistant::{Assistant, QueryOutcome};
use crate::config::Config;
use crate::indexer::{CancelOutcome, Indexer, RejectReason, TriggerOutcome};
use crate::scheduler;
use crate::services::Services;

#[derive(Clone)]
struct AppState {
    indexer: Arc<Indexer>,
    assistant: Arc<Assistant>,
}

/// Build the router over already-wired components.
pub fn router(indexer: Arc<Indexer>, assistant: Arc<Assistant>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tenants/{tenant}/ask", post(handle_ask))
        .route("/tenants/{tenant}/rebuild", post(handle_rebuild))
        .route("/tenants/{tenant}/cancel", post(handle_cancel))
        .route("/tenants/{tenant}/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { indexer, assistant })
}

/// Serve until the process is terminated. Starts the scheduler when
/// `[scheduler] enabled = true`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::build(config).await?;

    let _scheduler = config.scheduler.enabled.then(|| {
        scheduler::spawn(
            Arc::clone(&services.indexer),
            Duration::from_secs(config.scheduler.interval_secs),
        )
    });

    let app = router(services.indexer, services.assistant);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<IndexingState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<u8>,
}

struct AppError {
    status: StatusCode,
    detail: ErrorDetail,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            detail: ErrorDetail {
                code: code.to_string(),
                message: message.into(),
                state: None,
                progress: None,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.detail })).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", err), "request failed");
        internal(err.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

fn known_tenant(state: &AppState, tenant: &str) -> Result<(), AppError> {
    match state.indexer.default_selector(tenant) {
        Some(_) => Ok(()),
        None => Err(not_found(format!("unknown tenant: {}", tenant))),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /tenants/{tenant}/ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
}

async fn handle_ask(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Json<StructuredAnswer>, AppError> {
    known_tenant(&state, &tenant)?;
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    match state.assistant.answer_question(&tenant, &req.question).await? {
        QueryOutcome::Answered(answer) => Ok(Json(answer)),
        QueryOutcome::NotReady {
            status,
            progress,
            message,
        } => {
            let mut err = AppError::new(StatusCode::CONFLICT, "not_ready", message);
            err.detail.state = Some(status);
            err.detail.progress = Some(progress);
            Err(err)
        }
    }
}

// ============ POST /tenants/{tenant}/rebuild ============

#[derive(Deserialize)]
struct RebuildParams {
    #[serde(default)]
    reset: bool,
}

async fn handle_rebuild(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<RebuildParams>,
) -> Result<(StatusCode, Json<TriggerOutcome>), AppError> {
    let selector = state
        .indexer
        .default_selector(&tenant)
        .ok_or_else(|| not_found(format!("unknown tenant: {}", tenant)))?;

    let outcome = if params.reset {
        state.indexer.trigger_reset(&tenant, &selector).await?
    } else {
        state.indexer.trigger_rebuild(&tenant, &selector).await?
    };

    let status = match &outcome {
        TriggerOutcome::Accepted { .. } => StatusCode::ACCEPTED,
        TriggerOutcome::Rejected {
            reason: RejectReason::AlreadyRunning,
        } => StatusCode::CONFLICT,
        TriggerOutcome::Rejected {
            reason: RejectReason::UnknownTenant,
        } => StatusCode::NOT_FOUND,
    };
    Ok((status, Json(outcome)))
}

// ============ POST /tenants/{tenant}/cancel ============

async fn handle_cancel(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<(StatusCode, Json<CancelOutcome>), AppError> {
    let outcome = state.indexer.cancel(&tenant).await?;
    let status = match outcome {
        CancelOutcome::Cancelled => StatusCode::OK,
        CancelOutcome::NotRunning => StatusCode::CONFLICT,
        CancelOutcome::UnknownTenant => StatusCode::NOT_FOUND,
    };
    Ok((status, Json(outcome)))
}

// ============ GET /tenants/{tenant}/status ============

async fn handle_status(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<IndexingStatus>, AppError> {
    known_tenant(&state, &tenant)?;
    Ok(Json(state.indexer.get_status(&tenant).await?))
}
