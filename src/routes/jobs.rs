use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;

use crate::app_state::AppState;
use crate::error::{AppError, AppResult};
use crate::models::api::{CreateJobRequest, CreateJobResponse};
use crate::models::job::Job;

/// POST /api/jobs: Create an alignment job and start its worker.
///
/// Returns as soon as the job is recorded as `Pending`; the worker's result
/// is only observable by polling the status endpoint.
pub async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> AppResult<Json<CreateJobResponse>> {
    let Json(request) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let job_id = state.jobs.create_job(request).await?;
    Ok(Json(CreateJobResponse { job_id }))
}

/// GET /api/jobs/{job_id}: Current job record.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Job>> {
    Ok(Json(state.jobs.get_job_status_str(&job_id).await?))
}
