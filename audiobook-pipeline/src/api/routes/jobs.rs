//! Job status routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/admin/jobs/{id}/status` | Apply a status transition reported by a worker |
//! | GET | `/admin/audiobooks/{id}/jobs` | List every job of an audiobook |

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::database::models::{JobDbModel, JobStatusUpdate};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs/{id}/status", post(update_job_status))
        .route("/audiobooks/{id}/jobs", get(list_audiobook_jobs))
}

async fn update_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<JobStatusUpdate>,
) -> ApiResult<Json<JobDbModel>> {
    state.jobs.apply_status_update(&id, &update).await?;
    let job = state.jobs.get_job(&id).await?;
    tracing::debug!(job_id = %id, status = %job.status, "Job status reported");
    Ok(Json(job))
}

async fn list_audiobook_jobs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<JobDbModel>>> {
    state.catalog.get_audiobook(&id).await?;
    let jobs = state.jobs.list_jobs_for_audiobook(&id).await?;
    Ok(Json(jobs))
}
