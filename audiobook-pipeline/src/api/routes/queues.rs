//! Queue administration routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/admin/queues/stats` | Pending and failed depth per kind |
//! | DELETE | `/admin/queues/{kind}` | Drop every pending message of a kind |
//! | POST | `/admin/queues/{kind}/failed/{job_id}/retry` | Requeue a dead-lettered job |

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::database::models::JobKind;
use crate::queue::{QueueStats, queue_stats};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/queues/stats", get(get_stats))
        .route("/queues/{kind}", delete(clear_queue))
        .route("/queues/{kind}/failed/{job_id}/retry", post(retry_failed))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearResponse {
    pub kind: JobKind,
    pub cleared: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryResponse {
    pub job_id: String,
    pub kind: JobKind,
    pub priority: i64,
}

fn parse_kind(kind: &str) -> ApiResult<JobKind> {
    JobKind::parse(kind).ok_or_else(|| ApiError::bad_request(format!("Unknown job kind: {kind}")))
}

async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<Vec<QueueStats>>> {
    let mut stats = Vec::with_capacity(JobKind::ALL.len());
    for kind in JobKind::ALL {
        stats.push(queue_stats(state.queue.as_ref(), &state.layout, kind).await?);
    }
    Ok(Json(stats))
}

async fn clear_queue(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<ClearResponse>> {
    let kind = parse_kind(&kind)?;
    let cleared = state.queue.clear(&state.layout.working(kind)).await?;
    tracing::info!(kind = %kind, cleared, "Cleared queue");
    Ok(Json(ClearResponse { kind, cleared }))
}

async fn retry_failed(
    State(state): State<AppState>,
    Path((kind, job_id)): Path<(String, String)>,
) -> ApiResult<Json<RetryResponse>> {
    let kind = parse_kind(&kind)?;
    let message = state.retry.retry_dead_letter(kind, &job_id).await?;
    Ok(Json(RetryResponse {
        job_id: message.id,
        kind,
        priority: message.priority,
    }))
}
