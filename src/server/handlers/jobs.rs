use crate::executor::read_job_log;
use crate::jobs::{DownloadSpec, JobSummary, JobView};
use crate::server::error::{ApiError, ApiResult};
use crate::server::extract::AuthUser;
use crate::server::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// 提交下载响应
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
}

/// 健康检查响应
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// POST /api/download
/// 提交下载任务
pub async fn submit_download(
    AuthUser(caller): AuthUser,
    State(state): State<AppState>,
    payload: Result<Json<DownloadSpec>, JsonRejection>,
) -> ApiResult<Json<SubmitResponse>> {
    let Json(spec) = payload?;
    info!("API: 提交下载 {} (by {})", spec.model_id, caller.subject);

    let job_id = state.dispatch.submit(&caller, spec).await?;
    Ok(Json(SubmitResponse { job_id }))
}

/// GET /api/jobs
/// 最近的任务（有上限）
pub async fn list_jobs(
    AuthUser(caller): AuthUser,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<JobSummary>>> {
    Ok(Json(state.dispatch.list(&caller).await?))
}

/// GET /api/job/:id
pub async fn get_job(
    AuthUser(caller): AuthUser,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobView>> {
    Ok(Json(state.dispatch.status(&caller, &job_id).await?))
}

/// GET /api/job/:id/log
/// 任务日志全文；任务存在但尚未开始时返回空内容
pub async fn get_job_log(
    AuthUser(caller): AuthUser,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    // 先确认任务存在，路径参数不会直接拼进文件名
    state.dispatch.status(&caller, &job_id).await?;

    let content = read_job_log(&state.logs_dir, &job_id)
        .await
        .map_err(|e| ApiError::Internal(format!("读取任务日志失败: {}", e)))?
        .unwrap_or_default();

    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], content).into_response())
}
