use std::net::SocketAddr;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{CronError, Result};
use crate::logs::SharedLogStore;
use crate::master::JobManager;
use crate::scheduler::Job;

const DEFAULT_LOG_LIMIT: usize = 20;

#[derive(Clone)]
pub struct ApiState {
    pub jobs: JobManager,
    pub logs: SharedLogStore,
}

/// Envelope for every API response. `errno` is 0 on success.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub errno: i32,
    pub msg: String,
    pub data: Value,
}

impl ApiResponse {
    fn ok(data: impl Serialize) -> (StatusCode, Json<ApiResponse>) {
        match serde_json::to_value(data) {
            Ok(data) => (
                StatusCode::OK,
                Json(ApiResponse {
                    errno: 0,
                    msg: "success".to_string(),
                    data,
                }),
            ),
            Err(e) => Self::error(CronError::Decode(e)),
        }
    }

    fn error(err: CronError) -> (StatusCode, Json<ApiResponse>) {
        let status = match err {
            CronError::InvalidSchedule { .. } | CronError::Config(_) | CronError::Decode(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(status = %status, error = %err, "API request failed");

        (
            status,
            Json(ApiResponse {
                errno: -1,
                msg: err.to_string(),
                data: Value::Null,
            }),
        )
    }
}

fn respond<T: Serialize>(result: Result<T>) -> (StatusCode, Json<ApiResponse>) {
    match result {
        Ok(data) => ApiResponse::ok(data),
        Err(e) => ApiResponse::error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub name: String,
    #[serde(default)]
    pub skip: usize,
    pub limit: Option<usize>,
}

/// Build the control-plane router.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/job/save", post(save_job_handler))
        .route("/job/delete", post(delete_job_handler))
        .route("/job/list", get(list_jobs_handler))
        .route("/job/kill", post(kill_job_handler))
        .route("/job/log", get(job_log_handler))
        .route("/worker/list", get(list_workers_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` fires.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        CronError::Config(format!("failed to bind API server on {}: {}", addr, e))
    })?;

    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}

async fn save_job_handler(
    State(state): State<ApiState>,
    Json(job): Json<Job>,
) -> impl IntoResponse {
    respond(state.jobs.save_job(&job).await)
}

async fn delete_job_handler(
    State(state): State<ApiState>,
    Json(req): Json<NameRequest>,
) -> impl IntoResponse {
    respond(state.jobs.delete_job(&req.name).await)
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.jobs.list_jobs().await)
}

async fn kill_job_handler(
    State(state): State<ApiState>,
    Json(req): Json<NameRequest>,
) -> impl IntoResponse {
    respond(state.jobs.kill_job(&req.name).await)
}

async fn job_log_handler(
    State(state): State<ApiState>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    respond(state.logs.list(&query.name, query.skip, limit).await)
}

async fn list_workers_handler(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.jobs.list_workers().await)
}
