use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::event::HubEvent;
use crate::models::job::JobStatus;
use crate::services::hub::user_room;

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub user_id: Uuid,
    pub image_path: String,
    /// Stable hash of the image bytes; identical images share OCR work.
    pub image_hash: String,
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// POST /api/v1/jobs: record a new job, announce it to the owner's room
/// and start processing.
pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), StatusCode> {
    if req.image_path.trim().is_empty() || req.image_hash.trim().is_empty() {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    let job = state
        .jobs
        .create_job(req.user_id, &req.image_path, &req.image_hash)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "job_create_failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    state.hub.broadcast(
        &user_room(job.user_id),
        HubEvent::created(job.id, job.image_path.clone()),
    );
    state.orchestrator.process(job.id);
    tracing::info!(job_id = %job.id, user_id = %job.user_id, "job_created");

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// POST /api/v1/jobs/{job_id}/process: re-trigger a job. Duplicate triggers
/// are harmless; the job lock lets only one run through.
pub async fn process_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> StatusCode {
    state.orchestrator.process(job_id);
    tracing::info!(job_id = %job_id, "job_triggered");
    StatusCode::ACCEPTED
}
