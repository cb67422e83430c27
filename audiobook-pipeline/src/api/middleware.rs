//! Shared-secret authentication for the internal API.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::error::ApiError;
use crate::pipeline::status::INTERNAL_API_KEY_HEADER;

/// Internal API key check.
#[derive(Debug, Clone)]
pub struct InternalKeyAuth {
    api_key: Arc<str>,
    header_name: String,
}

impl InternalKeyAuth {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Arc::from(api_key.into()),
            header_name: INTERNAL_API_KEY_HEADER.to_string(),
        }
    }

    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    /// Constant-time comparison against the configured key.
    pub fn is_valid(&self, key: &str) -> bool {
        let expected = self.api_key.as_bytes();
        let given = key.as_bytes();
        if expected.is_empty() || expected.len() != given.len() {
            return false;
        }
        expected
            .iter()
            .zip(given)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }
}

/// Middleware rejecting requests without a valid internal key.
pub async fn internal_key_auth(
    State(auth): State<InternalKeyAuth>,
    request: Request,
    next: Next,
) -> Response {
    let api_key = request
        .headers()
        .get(auth.header_name())
        .and_then(|v| v.to_str().ok());

    match api_key {
        Some(key) if auth.is_valid(key) => next.run(request).await,
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "Invalid internal API key");
            ApiError::unauthorized("Invalid API key").into_response()
        }
        None => {
            tracing::warn!(path = %request.uri().path(), "Missing internal API key");
            ApiError::unauthorized("Missing API key").into_response()
        }
    }
}
