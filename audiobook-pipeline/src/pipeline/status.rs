//! Job status reporting.
//!
//! Workers that share the database write job transitions straight to the store;
//! workers deployed away from it post them to the internal job status webhook.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::debug;

use crate::database::models::{JobStatus, JobStatusUpdate};
use crate::database::repositories::JobRepository;
use crate::utils::http_client::error_body;
use crate::{Error, Result};

/// Header carrying the shared secret of the internal API.
pub const INTERNAL_API_KEY_HEADER: &str = "X-Internal-API-Key";

#[async_trait]
pub trait JobStatusReporter: Send + Sync {
    async fn report(&self, job_id: &str, update: &JobStatusUpdate) -> Result<()>;

    async fn mark_running(&self, job_id: &str) -> Result<()> {
        self.report(job_id, &JobStatusUpdate::new(JobStatus::Running))
            .await
    }

    async fn mark_completed(&self, job_id: &str) -> Result<()> {
        self.report(job_id, &JobStatusUpdate::new(JobStatus::Completed))
            .await
    }

    async fn mark_failed(&self, job_id: &str, error: &str, retry_count: u32) -> Result<()> {
        self.report(
            job_id,
            &JobStatusUpdate::failed(error).with_retry_count(i64::from(retry_count)),
        )
        .await
    }

    /// Straight from `running` back to `pending`, keeping the attempt's error.
    async fn requeue_pending(&self, job_id: &str, error: &str, retry_count: u32) -> Result<()> {
        let mut update =
            JobStatusUpdate::new(JobStatus::Pending).with_retry_count(i64::from(retry_count));
        update.error_message = Some(error.to_string());
        self.report(job_id, &update).await
    }

    async fn reset_pending(&self, job_id: &str, retry_count: u32) -> Result<()> {
        self.report(
            job_id,
            &JobStatusUpdate::new(JobStatus::Pending).with_retry_count(i64::from(retry_count)),
        )
        .await
    }
}

/// Writes transitions through the job repository.
pub struct StoreStatusReporter {
    jobs: Arc<dyn JobRepository>,
}

impl StoreStatusReporter {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl JobStatusReporter for StoreStatusReporter {
    async fn report(&self, job_id: &str, update: &JobStatusUpdate) -> Result<()> {
        self.jobs.apply_status_update(job_id, update).await
    }
}

/// Posts transitions to `{api_base}/admin/jobs/{id}/status`.
pub struct WebhookStatusReporter {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl WebhookStatusReporter {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self, job_id: &str) -> String {
        format!("{}/admin/jobs/{}/status", self.api_base, job_id)
    }
}

#[async_trait]
impl JobStatusReporter for WebhookStatusReporter {
    async fn report(&self, job_id: &str, update: &JobStatusUpdate) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(job_id))
            .header(INTERNAL_API_KEY_HEADER, &self.api_key)
            .json(update)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            let body = error_body(response).await;
            return Err(Error::conflict(format!("job {job_id}: {body}")));
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(Error::provider(
                "status webhook",
                format!("{status} for job {job_id}: {body}"),
            ));
        }

        debug!(job_id = %job_id, status = %update.status, "Reported job status");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;

    type Seen = Arc<Mutex<Vec<(String, JobStatusUpdate)>>>;

    async fn handler(
        State(seen): State<Seen>,
        Path(id): Path<String>,
        headers: HeaderMap,
        Json(update): Json<JobStatusUpdate>,
    ) -> StatusCode {
        if headers.get(INTERNAL_API_KEY_HEADER).and_then(|v| v.to_str().ok()) != Some("secret") {
            return StatusCode::UNAUTHORIZED;
        }
        if id == "busy" {
            return StatusCode::CONFLICT;
        }
        seen.lock().push((id, update));
        StatusCode::OK
    }

    async fn serve(seen: Seen) -> String {
        crate::utils::http_client::install_rustls_provider();
        let app = Router::new()
            .route("/admin/jobs/{id}/status", post(handler))
            .with_state(seen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_webhook_posts_update() {
        let seen = Seen::default();
        let base = serve(seen.clone()).await;
        let reporter = WebhookStatusReporter::new(reqwest::Client::new(), base, "secret");

        reporter.mark_failed("job-1", "boom", 2).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "job-1");
        assert_eq!(seen[0].1.status, JobStatus::Failed);
        assert_eq!(seen[0].1.error_message.as_deref(), Some("boom"));
        assert_eq!(seen[0].1.retry_count, Some(2));
    }

    #[tokio::test]
    async fn test_webhook_rejection_is_error() {
        let seen = Seen::default();
        let base = serve(seen.clone()).await;
        let reporter = WebhookStatusReporter::new(reqwest::Client::new(), base, "wrong");

        let err = reporter.mark_running("job-1").await.unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_conflict_maps_to_conflict() {
        let seen = Seen::default();
        let base = serve(seen.clone()).await;
        let reporter = WebhookStatusReporter::new(reqwest::Client::new(), base, "secret");

        let err = reporter.reset_pending("busy", 0).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "{err:?}");

        reporter.requeue_pending("job-2", "quota exceeded", 1).await.unwrap();
        let seen = seen.lock();
        assert_eq!(seen[0].1.status, JobStatus::Pending);
        assert_eq!(seen[0].1.error_message.as_deref(), Some("quota exceeded"));
        assert_eq!(seen[0].1.retry_count, Some(1));
    }
}
