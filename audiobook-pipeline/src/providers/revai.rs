//! Rev.ai speech-to-text client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{ProviderJobStatus, RawTranscript, TranscriptionProvider};
use crate::utils::http_client::{build_client, error_body};
use crate::{Error, Result};

const PROVIDER: &str = "rev.ai";
const TRANSCRIPT_ACCEPT: &str = "application/vnd.rev.transcript.v1.0+json";

/// Rev.ai client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevAiConfig {
    /// Base URL including the API version (default: https://api.rev.ai/speechtotext/v1).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub api_key: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.rev.ai/speechtotext/v1".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl RevAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: default_base_url(),
            api_key: api_key.into(),
            timeout_secs: default_timeout(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct RevAiJob {
    id: String,
    status: String,
    #[serde(default)]
    failure_detail: Option<String>,
}

pub struct RevAiClient {
    config: RevAiConfig,
    client: Client,
}

impl RevAiClient {
    pub fn new(config: RevAiConfig) -> Result<Self> {
        let client = build_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get_job(&self, handle: &str) -> Result<RevAiJob> {
        let response = self
            .client
            .get(self.url(&format!("/jobs/{handle}")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::provider(
                PROVIDER,
                format!("job status request failed with {}: {}", status, error_body(response).await),
            ));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl TranscriptionProvider for RevAiClient {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn submit(&self, audio_ref: &str, job_id: &str) -> Result<String> {
        let response = self
            .client
            .post(self.url("/jobs"))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "media_url": audio_ref,
                "metadata": format!("audiobook pipeline job {job_id}"),
            }))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(Error::provider(
                PROVIDER,
                format!("submit failed with {}: {}", status, error_body(response).await),
            ));
        }

        let job: RevAiJob = response.json().await?;
        debug!(handle = %job.id, status = %job.status, "Submitted transcription job");
        Ok(job.id)
    }

    async fn poll_status(&self, handle: &str) -> Result<ProviderJobStatus> {
        let job = self.get_job(handle).await?;
        Ok(ProviderJobStatus::from_provider(&job.status, job.failure_detail))
    }

    async fn fetch_result(&self, handle: &str) -> Result<RawTranscript> {
        let response = self
            .client
            .get(self.url(&format!("/jobs/{handle}/transcript")))
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::ACCEPT, TRANSCRIPT_ACCEPT)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::provider(
                PROVIDER,
                format!("transcript request failed with {}: {}", status, error_body(response).await),
            ));
        }

        Ok(response.json().await?)
    }
}
