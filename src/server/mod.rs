use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::agent::protocol::{AgentDirective, AgentReport};
use crate::error::PlaneError;
use crate::model::{JobDetail, JobSpec};
use crate::plane::Plane;
use crate::pool::ResourcePool;
use crate::scheduler::agent_hub::AgentInfo;
use crate::scheduler::ExecOutput;

#[derive(Clone)]
pub struct ApiState {
    pub plane: Arc<Plane>,
}

#[derive(Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub name: String,
    pub pool: String,
    pub status: String,
    pub steps: usize,
    pub failure_reason: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
}

#[derive(Serialize, Deserialize)]
pub struct CancelResponse {
    pub canceled: bool,
}

#[derive(Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A [`PlaneError`] rendered as a JSON error body.
pub struct ApiError(PlaneError);

impl From<PlaneError> for ApiError {
    fn from(e: PlaneError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PlaneError::Validation(_) | PlaneError::PoolNotFound(_) => StatusCode::BAD_REQUEST,
            PlaneError::AlreadySplit(_) | PlaneError::IllegalTransition { .. } => {
                StatusCode::CONFLICT
            }
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            PlaneError::Backend(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn router(plane: Arc<Plane>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/agents", get(list_agents_handler))
        .route("/api/v1/agents/report", post(agent_report_handler))
        .route("/api/v1/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/v1/jobs/:id", get(job_detail_handler))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job_handler))
        .route("/api/v1/tasks/:id/cancel", post(cancel_task_handler))
        .route("/api/v1/tasks/:id/exec", post(exec_handler))
        .route("/api/v1/pools", get(list_pools_handler))
        .route("/api/v1/pools/:name", put(upsert_pool_handler))
        .layer(cors)
        .with_state(ApiState { plane })
}

/// Serve the API until `shutdown` fires.
pub async fn run_server(
    addr: SocketAddr,
    plane: Arc<Plane>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");
    axum::serve(listener, router(plane))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn agent_report_handler(
    State(state): State<ApiState>,
    Json(report): Json<AgentReport>,
) -> ApiResult<AgentDirective> {
    Ok(Json(state.plane.handle_agent_report(report).await?))
}

async fn list_agents_handler(State(state): State<ApiState>) -> Json<Vec<AgentInfo>> {
    let agents = match state.plane.agent_hub() {
        Some(hub) => hub.agents().await,
        None => Vec::new(),
    };
    Json(agents)
}

async fn list_jobs_handler(State(state): State<ApiState>) -> Json<Vec<JobSummary>> {
    let jobs = state
        .plane
        .list_jobs()
        .await
        .into_iter()
        .map(|job| JobSummary {
            id: job.id,
            name: job.name,
            pool: job.pool,
            status: job.status.to_string(),
            steps: job.steps.len(),
            failure_reason: job.failure_reason,
        })
        .collect();
    Json(jobs)
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(spec): Json<JobSpec>,
) -> std::result::Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let job_id = state.plane.submit_job(spec).await?;
    Ok((StatusCode::CREATED, Json(SubmitJobResponse { job_id })))
}

async fn job_detail_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<JobDetail> {
    Ok(Json(state.plane.job_detail(id).await?))
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<CancelResponse> {
    let canceled = state.plane.cancel_job(id).await?;
    Ok(Json(CancelResponse { canceled }))
}

async fn cancel_task_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<CancelResponse> {
    let canceled = state.plane.cancel_task(id).await?;
    Ok(Json(CancelResponse { canceled }))
}

async fn exec_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ExecRequest>,
) -> ApiResult<ExecOutput> {
    Ok(Json(state.plane.exec(id, &request.command).await?))
}

async fn list_pools_handler(State(state): State<ApiState>) -> Json<Vec<ResourcePool>> {
    let pools = state
        .plane
        .pools()
        .all()
        .into_iter()
        .map(|p| ResourcePool::clone(&p))
        .collect();
    Json(pools)
}

async fn upsert_pool_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(pool): Json<ResourcePool>,
) -> ApiResult<ResourcePool> {
    if pool.name != name {
        return Err(PlaneError::Validation(format!(
            "pool name {:?} does not match path {:?}",
            pool.name, name
        ))
        .into());
    }
    state.plane.pools().upsert(pool.clone())?;
    Ok(Json(pool))
}
