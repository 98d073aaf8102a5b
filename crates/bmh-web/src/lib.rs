//! Axum JSON API for submitting BMH jobs and polling their progress.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bmh_core::BusinessDescriptor;
use bmh_engine::{
    maybe_build_cleanup_scheduler, max_age_from_hours, EngineConfig, EngineError, HealthReport, JobList,
    JobResultsView, JobStatusView, Orchestrator, SubmitReceipt,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bmh-web";

const DEFAULT_CLEANUP_MAX_AGE_HOURS: f64 = 24.0;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(message) => ApiError::BadRequest(message),
            EngineError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Either `name` or `business_name` identifies the business.
#[derive(Debug, Default, Deserialize)]
struct ScrapeRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    business_name: Option<String>,
    #[serde(default)]
    business_url: Option<String>,
    #[serde(default)]
    google_maps_url: Option<String>,
    #[serde(default)]
    trustpilot_url: Option<String>,
}

impl ScrapeRequest {
    fn into_descriptor(self) -> BusinessDescriptor {
        let name = [self.name, self.business_name]
            .into_iter()
            .flatten()
            .find(|n| !n.trim().is_empty())
            .unwrap_or_default();
        BusinessDescriptor {
            name,
            business_url: self.business_url,
            google_maps_url: self.google_maps_url,
            trustpilot_url: self.trustpilot_url,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CleanupRequest {
    #[serde(default)]
    max_age_hours: Option<f64>,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    message: String,
    removed: usize,
    remaining_jobs: usize,
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/scrape", post(scrape_handler))
        .route("/status/{job_id}", get(status_handler))
        .route("/results/{job_id}", get(results_handler))
        .route("/jobs", get(jobs_handler))
        .route("/cleanup", post(cleanup_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("BMH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5000);
    let config = EngineConfig::from_env();
    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);

    let scheduler = maybe_build_cleanup_scheduler(&config, orchestrator.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting cleanup scheduler")?;
        info!(cron = %config.cleanup_cron, "cleanup scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(orchestrator))).await?;
    Ok(())
}

/// Decode a JSON body, treating an empty body as `T::default()`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| ApiError::BadRequest(format!("Invalid JSON body: {err}")))
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(EngineError::NotFound { job_id: Uuid::nil() }.to_string()))
}

async fn scrape_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<SubmitReceipt>, ApiError> {
    let request: ScrapeRequest = parse_body(&body)?;
    let receipt = state.orchestrator.submit(request.into_descriptor()).await?;
    Ok(Json(receipt))
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusView>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.orchestrator.get_status(job_id).await?))
}

async fn results_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResultsView>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.orchestrator.get_results(job_id).await?))
}

async fn jobs_handler(State(state): State<Arc<AppState>>) -> Json<JobList> {
    Json(state.orchestrator.list_jobs().await)
}

async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<CleanupResponse>, ApiError> {
    let request: CleanupRequest = parse_body(&body)?;
    let max_age = max_age_from_hours(request.max_age_hours.unwrap_or(DEFAULT_CLEANUP_MAX_AGE_HOURS))?;
    let report = state.orchestrator.cleanup(max_age).await;
    Ok(Json(CleanupResponse {
        message: format!("Cleaned up {} old jobs", report.removed),
        removed: report.removed,
        remaining_jobs: report.remaining_jobs,
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(state.orchestrator.health().await)
}
