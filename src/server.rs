//! HTTP control surface.
//!
//! A thin JSON API over the [`Orchestrator`]. Scan and process requests are
//! accepted as background jobs and answered with `202` and a job id; the
//! job can then be polled or canceled.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness (returns version) |
//! | `GET`  | `/ready` | Database and provider readiness |
//! | `POST` | `/scan` | Submit a scan job |
//! | `POST` | `/process` | Submit a process job |
//! | `GET`  | `/jobs` | List jobs (`?state=&limit=`) |
//! | `GET`  | `/jobs/{id}` | Get one job |
//! | `POST` | `/jobs/{id}/cancel` | Cancel a queued or running job |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "batch_size must be greater than 0" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::chunk::ChunkingStrategy;
use crate::error::is_validation;
use crate::models::{Job, JobState};
use crate::orchestrator::{HealthReport, Orchestrator, ProcessOptions, ReadyReport};
use crate::summarize::SummaryType;

const DEFAULT_JOB_LIMIT: i64 = 50;

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

/// Build the router. Exposed separately from [`run_server`] so tests can
/// serve it on an ephemeral port.
pub fn router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/scan", post(handle_scan))
        .route("/process", post(handle_process))
        .route("/jobs", get(handle_list_jobs))
        .route("/jobs/{id}", get(handle_get_job))
        .route("/jobs/{id}/cancel", post(handle_cancel_job))
        .layer(cors)
        .with_state(AppState { orchestrator })
}

/// Serve on `[server].bind` until the process is terminated.
pub async fn run_server(orchestrator: Orchestrator) -> anyhow::Result<()> {
    let bind_addr = orchestrator.config().server.bind.clone();
    let app = router(orchestrator);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "docflow server listening");
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
}

struct AppError {
    status: StatusCode,
    code: String,
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
        if is_validation(&err) {
            return bad_request(format!("{:#}", err));
        }
        error!(error = %format!("{:#}", err), "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: format!("{:#}", err),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ Health ============

async fn handle_health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.orchestrator.health())
}

/// `200` when ready, `503` otherwise; the body is the same report.
async fn handle_ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyReport>) {
    let report = state.orchestrator.ready().await;
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

// ============ Jobs ============

#[derive(Serialize)]
struct SubmittedResponse {
    job_id: String,
    state: JobState,
}

fn submitted(job_id: String) -> (StatusCode, Json<SubmittedResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(SubmittedResponse {
            job_id,
            state: JobState::Queued,
        }),
    )
}

#[derive(Deserialize)]
struct ScanRequest {
    root_path: PathBuf,
    #[serde(default = "default_recursive")]
    recursive: bool,
}

fn default_recursive() -> bool {
    true
}

async fn handle_scan(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<(StatusCode, Json<SubmittedResponse>), AppError> {
    let job_id = state
        .orchestrator
        .submit_scan(&req.root_path, req.recursive)
        .await?;
    Ok(submitted(job_id))
}

/// Every field is optional and defaults to `[pipeline]`.
#[derive(Deserialize, Default)]
struct ProcessRequest {
    root_path: Option<PathBuf>,
    chunking_strategy: Option<ChunkingStrategy>,
    generate_summaries: Option<bool>,
    generate_embeddings: Option<bool>,
    generate_links: Option<bool>,
    summary_type: Option<SummaryType>,
    batch_size: Option<usize>,
    max_concurrent: Option<usize>,
    preferred_provider: Option<String>,
}

impl ProcessRequest {
    fn into_options(self, defaults: ProcessOptions) -> ProcessOptions {
        ProcessOptions {
            root_path: self.root_path.or(defaults.root_path),
            chunking_strategy: self.chunking_strategy.unwrap_or(defaults.chunking_strategy),
            generate_summaries: self.generate_summaries.unwrap_or(defaults.generate_summaries),
            generate_embeddings: self.generate_embeddings.unwrap_or(defaults.generate_embeddings),
            generate_links: self.generate_links.unwrap_or(defaults.generate_links),
            summary_type: self.summary_type.unwrap_or(defaults.summary_type),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            max_concurrent: self.max_concurrent.unwrap_or(defaults.max_concurrent),
            preferred_provider: self.preferred_provider.or(defaults.preferred_provider),
        }
    }
}

async fn handle_process(
    State(state): State<AppState>,
    body: Option<Json<ProcessRequest>>,
) -> Result<(StatusCode, Json<SubmittedResponse>), AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let options = req.into_options(ProcessOptions::from_config(state.orchestrator.config()));
    let job_id = state.orchestrator.submit_process(options).await?;
    Ok(submitted(job_id))
}

#[derive(Deserialize)]
struct ListJobsQuery {
    state: Option<String>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct JobListResponse {
    jobs: Vec<Job>,
}

async fn handle_list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, AppError> {
    let job_state = query
        .state
        .as_deref()
        .map(str::parse::<JobState>)
        .transpose()
        .map_err(|e| bad_request(e.to_string()))?;
    let limit = query.limit.unwrap_or(DEFAULT_JOB_LIMIT);
    if limit <= 0 {
        return Err(bad_request("limit must be greater than 0"));
    }
    let jobs = state.orchestrator.list_jobs(job_state, limit).await?;
    Ok(Json(JobListResponse { jobs }))
}

async fn handle_get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let job = state
        .orchestrator
        .get_job(&id)
        .await?
        .ok_or_else(|| not_found(format!("no job with id: {}", id)))?;
    Ok(Json(job))
}

#[derive(Serialize)]
struct CancelResponse {
    job_id: String,
    canceled: bool,
    state: JobState,
}

async fn handle_cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    if state.orchestrator.get_job(&id).await?.is_none() {
        return Err(not_found(format!("no job with id: {}", id)));
    }
    let canceled = state.orchestrator.cancel(&id).await?;
    let job = state
        .orchestrator
        .get_job(&id)
        .await?
        .ok_or_else(|| not_found(format!("no job with id: {}", id)))?;
    Ok(Json(CancelResponse {
        job_id: id,
        canceled,
        state: job.state,
    }))
}
