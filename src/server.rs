//! Read-only JSON HTTP API over the association store.
//!
//! Exposes the aggregate queries for dashboards and scripts. Nothing here
//! writes; embedding and association runs stay on the CLI.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/status` | Embedding coverage and association count |
//! | `GET`  | `/issues?limit=` | Issues ranked by linked-signal count |
//! | `GET`  | `/issues/{identifier}` | One issue |
//! | `GET`  | `/issues/{identifier}/signals?min_score=` | Signals linked to an issue, best first |
//! | `GET`  | `/issues/{identifier}/signals/{signal_id}` | One association |
//! | `GET`  | `/signals?limit=` | Signals ranked by linked-issue count |
//! | `GET`  | `/signals/{id}` | One signal |
//! | `GET`  | `/signals/{id}/issues?min_score=` | Issues linked to a signal, best first |
//! | `GET`  | `/signals/{id}/issues/{identifier}` | One association |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "issue not found: ENG-9" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db;
use crate::models::{Association, Issue, Signal};
use crate::queries::{
    self, EmbeddingsStatus, IssueWithCount, LinkedIssue, LinkedSignal, SignalWithCount,
};

#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
    config: Arc<Config>,
}

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.server.bind).await?;
    println!("siglink API listening on http://{}", listener.local_addr()?);
    serve(listener, config).await
}

/// Serve the API on an already-bound listener.
pub async fn serve(listener: TcpListener, config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let app = router(pool, config.clone());
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(pool: SqlitePool, config: Config) -> Router {
    let state = AppState {
        pool,
        config: Arc::new(config),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/issues", get(handle_list_issues))
        .route("/issues/{identifier}", get(handle_get_issue))
        .route("/issues/{identifier}/signals", get(handle_issue_signals))
        .route(
            "/issues/{identifier}/signals/{signal_id}",
            get(handle_issue_signal_link),
        )
        .route("/signals", get(handle_list_signals))
        .route("/signals/{id}", get(handle_get_signal))
        .route("/signals/{id}/issues", get(handle_signal_issues))
        .route(
            "/signals/{id}/issues/{identifier}",
            get(handle_signal_issue_link),
        )
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

fn parse_signal_id(raw: &str) -> Result<i64, AppError> {
    raw.parse()
        .map_err(|_| bad_request(format!("signal id must be an integer, got {:?}", raw)))
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct ScoreParams {
    min_score: Option<f64>,
}

fn min_score(
    params: Result<Query<ScoreParams>, QueryRejection>,
    default: f64,
) -> Result<f64, AppError> {
    let Query(params) = params.map_err(|e| bad_request(e.body_text()))?;
    match params.min_score {
        Some(s) if !s.is_finite() => Err(bad_request("min_score must be a finite number")),
        Some(s) => Ok(s),
        None => Ok(default),
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn handle_status(State(state): State<AppState>) -> ApiResult<EmbeddingsStatus> {
    Ok(Json(queries::get_embeddings_status(&state.pool).await?))
}

#[derive(Serialize)]
struct IssueList {
    issues: Vec<IssueWithCount>,
}

async fn handle_list_issues(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<IssueList> {
    let Query(params) = params.map_err(|e| bad_request(e.body_text()))?;
    let issues = queries::list_issues_with_counts(&state.pool, params.limit).await?;
    Ok(Json(IssueList { issues }))
}

async fn handle_get_issue(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> ApiResult<Issue> {
    queries::get_issue(&state.pool, &identifier)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("issue not found: {}", identifier)))
}

#[derive(Serialize)]
struct IssueSignals {
    issue_id: String,
    min_score: f64,
    signals: Vec<LinkedSignal>,
}

async fn handle_issue_signals(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    params: Result<Query<ScoreParams>, QueryRejection>,
) -> ApiResult<IssueSignals> {
    let min_score = min_score(params, state.config.association.min_score)?;
    if queries::get_issue(&state.pool, &identifier).await?.is_none() {
        return Err(not_found(format!("issue not found: {}", identifier)));
    }
    let signals = queries::get_signals_for_issue(&state.pool, &identifier, min_score).await?;
    Ok(Json(IssueSignals {
        issue_id: identifier,
        min_score,
        signals,
    }))
}

async fn association_or_404(
    state: &AppState,
    signal_id: i64,
    identifier: &str,
) -> ApiResult<Association> {
    queries::get_association(&state.pool, signal_id, identifier)
        .await?
        .map(Json)
        .ok_or_else(|| {
            not_found(format!(
                "no association between signal {} and issue {}",
                signal_id, identifier
            ))
        })
}

async fn handle_issue_signal_link(
    State(state): State<AppState>,
    Path((identifier, signal_id)): Path<(String, String)>,
) -> ApiResult<Association> {
    let signal_id = parse_signal_id(&signal_id)?;
    association_or_404(&state, signal_id, &identifier).await
}

#[derive(Serialize)]
struct SignalList {
    signals: Vec<SignalWithCount>,
}

async fn handle_list_signals(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<SignalList> {
    let Query(params) = params.map_err(|e| bad_request(e.body_text()))?;
    let signals = queries::list_signals_with_counts(&state.pool, params.limit).await?;
    Ok(Json(SignalList { signals }))
}

async fn handle_get_signal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Signal> {
    let id = parse_signal_id(&id)?;
    queries::get_signal(&state.pool, id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("signal not found: {}", id)))
}

#[derive(Serialize)]
struct SignalIssues {
    signal_id: i64,
    min_score: f64,
    issues: Vec<LinkedIssue>,
}

async fn handle_signal_issues(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Result<Query<ScoreParams>, QueryRejection>,
) -> ApiResult<SignalIssues> {
    let id = parse_signal_id(&id)?;
    let min_score = min_score(params, state.config.association.min_score)?;
    if queries::get_signal(&state.pool, id).await?.is_none() {
        return Err(not_found(format!("signal not found: {}", id)));
    }
    let issues = queries::get_issues_for_signal(&state.pool, id, min_score).await?;
    Ok(Json(SignalIssues {
        signal_id: id,
        min_score,
        issues,
    }))
}

async fn handle_signal_issue_link(
    State(state): State<AppState>,
    Path((id, identifier)): Path<(String, String)>,
) -> ApiResult<Association> {
    let signal_id = parse_signal_id(&id)?;
    association_or_404(&state, signal_id, &identifier).await
}
