//! Early summarize trigger.
//!
//! Once the first chapter of an audiobook is transcribed, summarization can start
//! on that chapter alone instead of waiting for the whole book. The transcription
//! stage reports the event through a [`StageNotifier`]; the receiving side is
//! [`SummarizeTrigger`], reachable in-process or over the internal HTTP API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::producer::Producer;
use super::status::INTERNAL_API_KEY_HEADER;
use crate::database::models::{JobKind, OutputType};
use crate::database::repositories::{
    CatalogRepository, JobRepository, OutputRepository, TranscriptRepository,
};
use crate::queue::InputScope;
use crate::utils::http_client::error_body;
use crate::{Error, Result};

#[async_trait]
pub trait StageNotifier: Send + Sync {
    /// The first chapter of `audiobook_id` has a transcript.
    async fn first_unit_transcribed(&self, audiobook_id: &str) -> Result<()>;
}

/// Notify and swallow any failure; the notification must never fail the caller's job.
pub async fn notify_best_effort(notifier: &dyn StageNotifier, audiobook_id: &str) {
    match notifier.first_unit_transcribed(audiobook_id).await {
        Ok(()) => debug!(audiobook_id = %audiobook_id, "Summarize trigger notified"),
        Err(Error::Conflict(reason)) => {
            debug!(audiobook_id = %audiobook_id, %reason, "Summarize already scheduled")
        }
        Err(e) => warn!(audiobook_id = %audiobook_id, error = %e, "Summarize trigger failed"),
    }
}

/// Response of a successful trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub audiobook_id: String,
    pub job_id: String,
    pub message: String,
    pub chapters_verified: usize,
}

pub struct SummarizeTrigger {
    catalog: Arc<dyn CatalogRepository>,
    transcripts: Arc<dyn TranscriptRepository>,
    outputs: Arc<dyn OutputRepository>,
    jobs: Arc<dyn JobRepository>,
    producer: Arc<Producer>,
}

impl SummarizeTrigger {
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        transcripts: Arc<dyn TranscriptRepository>,
        outputs: Arc<dyn OutputRepository>,
        jobs: Arc<dyn JobRepository>,
        producer: Arc<Producer>,
    ) -> Self {
        Self {
            catalog,
            transcripts,
            outputs,
            jobs,
            producer,
        }
    }

    /// Create and enqueue a summarize job scoped to the first chapter.
    pub async fn trigger(&self, audiobook_id: &str) -> Result<TriggerResponse> {
        self.catalog.get_audiobook(audiobook_id).await?;

        let chapters = self.catalog.list_chapters(audiobook_id).await?;
        let Some(first) = chapters.first() else {
            return Err(Error::validation(format!(
                "audiobook {audiobook_id} has no chapters"
            )));
        };

        if self
            .transcripts
            .get_transcript(audiobook_id, Some(&first.id))
            .await?
            .is_none()
        {
            return Err(Error::validation(format!(
                "chapter {} is not transcribed",
                first.chapter_number
            )));
        }

        if let Some(active) = self
            .jobs
            .find_active_job(audiobook_id, None, JobKind::Summarize)
            .await?
        {
            return Err(Error::conflict(format!(
                "summarize job {} is already {}",
                active.id, active.status
            )));
        }

        if self
            .outputs
            .get_output(audiobook_id, OutputType::Summary)
            .await?
            .is_some()
        {
            return Err(Error::conflict(format!(
                "audiobook {audiobook_id} already has a summary"
            )));
        }

        let job = self
            .producer
            .create_and_enqueue(
                audiobook_id,
                None,
                JobKind::Summarize,
                None,
                Some(InputScope::FirstUnit),
            )
            .await?;

        info!(audiobook_id = %audiobook_id, job_id = %job.id, "Triggered early summarize");
        Ok(TriggerResponse {
            audiobook_id: audiobook_id.to_string(),
            job_id: job.id,
            message: "Summarize and tag jobs triggered successfully".to_string(),
            chapters_verified: chapters.len(),
        })
    }
}

/// Calls [`SummarizeTrigger`] directly, for single-process deployments.
pub struct InProcessStageNotifier {
    trigger: Arc<SummarizeTrigger>,
}

impl InProcessStageNotifier {
    pub fn new(trigger: Arc<SummarizeTrigger>) -> Self {
        Self { trigger }
    }
}

#[async_trait]
impl StageNotifier for InProcessStageNotifier {
    async fn first_unit_transcribed(&self, audiobook_id: &str) -> Result<()> {
        self.trigger.trigger(audiobook_id).await.map(|_| ())
    }
}

/// Posts to the internal trigger endpoint of the API process.
pub struct HttpStageNotifier {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl HttpStageNotifier {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self, audiobook_id: &str) -> String {
        format!(
            "{}/internal/audiobooks/{}/trigger-summarize-tag",
            self.api_base, audiobook_id
        )
    }
}

#[async_trait]
impl StageNotifier for HttpStageNotifier {
    async fn first_unit_transcribed(&self, audiobook_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(audiobook_id))
            .header(INTERNAL_API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(Error::conflict(error_body(response).await));
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(Error::provider("summarize trigger", format!("{status}: {body}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};

    struct FailingNotifier;

    #[async_trait]
    impl StageNotifier for FailingNotifier {
        async fn first_unit_transcribed(&self, _audiobook_id: &str) -> Result<()> {
            Err(Error::Other("api unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_best_effort_swallows_errors() {
        notify_best_effort(&FailingNotifier, "book").await;
    }

    async fn serve() -> String {
        crate::utils::http_client::install_rustls_provider();
        let app = Router::new().route(
            "/internal/audiobooks/{id}/trigger-summarize-tag",
            post(|Path(id): Path<String>, headers: HeaderMap| async move {
                let authorized = headers
                    .get(INTERNAL_API_KEY_HEADER)
                    .and_then(|v| v.to_str().ok())
                    == Some("secret");
                match (authorized, id.as_str()) {
                    (false, _) => (StatusCode::UNAUTHORIZED, Json(serde_json::json!({}))),
                    (true, "done") => (
                        StatusCode::CONFLICT,
                        Json(serde_json::json!({"message": "already has a summary"})),
                    ),
                    (true, _) => (StatusCode::OK, Json(serde_json::json!({"job_id": "j"}))),
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_http_notifier_status_mapping() {
        let base = serve().await;

        let ok = HttpStageNotifier::new(reqwest::Client::new(), base.clone(), "secret");
        ok.first_unit_transcribed("book").await.unwrap();
        assert!(matches!(
            ok.first_unit_transcribed("done").await,
            Err(Error::Conflict(_))
        ));

        let unauthorized = HttpStageNotifier::new(reqwest::Client::new(), base, "nope");
        assert!(matches!(
            unauthorized.first_unit_transcribed("book").await,
            Err(Error::Provider { .. })
        ));
    }
}
