//! Internal API server.

use axum::Router;
use axum::extract::Request;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::middleware::{InternalKeyAuth, internal_key_auth};
use crate::api::routes;
use crate::database::repositories::{CatalogRepository, JobRepository};
use crate::error::{Error, Result};
use crate::pipeline::{Producer, RetryCoordinator, SummarizeTrigger};
use crate::queue::{QueueBackend, TopicLayout};

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobRepository>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub producer: Arc<Producer>,
    pub retry: Arc<RetryCoordinator>,
    pub trigger: Arc<SummarizeTrigger>,
    pub queue: Arc<dyn QueueBackend>,
    pub layout: TopicLayout,
}

/// Build the full router: every route sits behind the internal key check.
pub fn router(state: AppState, api_key: &str) -> Router {
    let auth = InternalKeyAuth::new(api_key);
    routes::create_router(state)
        .layer(axum::middleware::from_fn_with_state(auth, internal_key_auth))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    tracing::info_span!(
                        "request",
                        method = %req.method(),
                        path = %req.uri().path(),
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, _span: &Span| {
                        tracing::info!(
                            status = res.status().as_u16(),
                            latency_ms = latency.as_millis() as u64,
                            "finished processing request"
                        );
                    },
                ),
        )
}

pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    api_key: String,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(
        config: ApiServerConfig,
        state: AppState,
        api_key: impl Into<String>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            api_key: api_key.into(),
            cancel_token,
        }
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid API address: {e}")))
    }

    /// Serve until the cancellation token fires.
    pub async fn run(&self) -> Result<()> {
        let addr = self.addr()?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("API server listening on http://{}", addr);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let router = router(self.state.clone(), &self.api_key);
        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await?;

        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
