//! API route definitions.

pub mod internal;
pub mod jobs;
pub mod queues;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/internal", internal::router())
        .nest("/admin", jobs::router().merge(queues::router()))
        .with_state(state)
}
