//! Stage-to-stage trigger routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/internal/audiobooks/{id}/trigger-summarize-tag` | Start summarization on the first chapter |

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::pipeline::TriggerResponse;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/audiobooks/{id}/trigger-summarize-tag",
        post(trigger_summarize_tag),
    )
}

/// 404 for an unknown audiobook, 400 when the first chapter has no transcript,
/// 409 when a summarize job is active or a summary already exists.
async fn trigger_summarize_tag(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TriggerResponse>> {
    let response = state.trigger.trigger(&id).await?;
    Ok(Json(response))
}
