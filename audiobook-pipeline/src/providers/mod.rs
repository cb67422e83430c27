//! External capability clients.
//!
//! Stages depend only on the traits here; [`revai`] and [`gemini`] are the HTTP
//! implementations. Every failure (transport, non-2xx status, undecodable body) comes
//! back as an ordinary [`crate::Error`] and is treated as a stage failure.

pub mod gemini;
pub mod revai;

pub use gemini::{GeminiClient, GeminiConfig};
pub use revai::{RevAiClient, RevAiConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Status reported by a transcription provider for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderJobStatus {
    InProgress(String),
    Completed,
    Failed(Option<String>),
    Cancelled,
}

impl ProviderJobStatus {
    /// Map a provider status string onto the terminal/non-terminal states.
    pub fn from_provider(status: &str, failure: Option<String>) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "completed" | "transcribed" | "done" => Self::Completed,
            "failed" | "error" => Self::Failed(failure),
            "canceled" | "cancelled" => Self::Cancelled,
            other => Self::InProgress(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress(_))
    }
}

/// Raw provider transcript: speaker monologues of timed elements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTranscript {
    #[serde(default)]
    pub monologues: Vec<Monologue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Monologue {
    #[serde(default)]
    pub speaker: Option<i64>,
    #[serde(default)]
    pub elements: Vec<TranscriptElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptElement {
    /// `text` for words, `punct` for punctuation.
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default)]
    pub ts: Option<f64>,
    #[serde(default)]
    pub end_ts: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Submit audio for transcription; returns the provider's job handle.
    async fn submit(&self, audio_ref: &str, job_id: &str) -> Result<String>;

    async fn poll_status(&self, handle: &str) -> Result<ProviderJobStatus>;

    async fn fetch_result(&self, handle: &str) -> Result<RawTranscript>;
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model(&self) -> &str;

    async fn generate_text(&self, prompt: &str, temperature: f32, max_tokens: u32)
    -> Result<String>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn generate_embedding(&self, text: &str) -> Result<Vec<f64>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("completed", ProviderJobStatus::Completed)]
    #[case("transcribed", ProviderJobStatus::Completed)]
    #[case("DONE", ProviderJobStatus::Completed)]
    #[case("failed", ProviderJobStatus::Failed(None))]
    #[case("error", ProviderJobStatus::Failed(None))]
    #[case("canceled", ProviderJobStatus::Cancelled)]
    #[case("cancelled", ProviderJobStatus::Cancelled)]
    #[case("in_progress", ProviderJobStatus::InProgress("in_progress".into()))]
    fn test_status_mapping(#[case] raw: &str, #[case] expected: ProviderJobStatus) {
        assert_eq!(ProviderJobStatus::from_provider(raw, None), expected);
    }

    #[test]
    fn test_terminal() {
        assert!(ProviderJobStatus::Completed.is_terminal());
        assert!(ProviderJobStatus::Cancelled.is_terminal());
        assert!(!ProviderJobStatus::InProgress("queued".into()).is_terminal());
    }
}
