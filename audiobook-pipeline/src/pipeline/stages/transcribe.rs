//! Transcription stage: submit audio, poll the provider, persist the transcript.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StageHandler;
use crate::database::models::{JobKind, TranscriptDbModel, TranscriptSegment};
use crate::database::repositories::{CatalogRepository, TranscriptRepository};
use crate::pipeline::producer::Producer;
use crate::pipeline::trigger::{StageNotifier, notify_best_effort};
use crate::providers::{ProviderJobStatus, RawTranscript, TranscriptionProvider};
use crate::queue::QueueMessage;
use crate::{Error, Result};

/// Confidence reported when the provider gives none.
pub const DEFAULT_CONFIDENCE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscriptionSettings {
    pub poll_interval: Duration,
    /// Total polling budget. Polling stops after `timeout / poll_interval` attempts or
    /// once `timeout` has elapsed, whichever comes first.
    pub timeout: Duration,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(1800),
        }
    }
}

impl TranscriptionSettings {
    pub fn max_polls(&self) -> u64 {
        let interval = self.poll_interval.as_millis().max(1);
        (self.timeout.as_millis() / interval).max(1) as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTranscript {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub confidence: f64,
}

/// Flatten provider monologues into text and timed word segments.
pub fn normalize_transcript(raw: &RawTranscript) -> NormalizedTranscript {
    let mut segments = Vec::new();
    let mut confidence_sum = 0.0;
    let mut confidence_count = 0usize;

    for monologue in &raw.monologues {
        for element in monologue.elements.iter().filter(|e| e.kind == "text") {
            if let Some(c) = element.confidence {
                confidence_sum += c;
                confidence_count += 1;
            }
            let start = element.ts.unwrap_or_default();
            segments.push(TranscriptSegment {
                start,
                end: element.end_ts.unwrap_or(start),
                text: element.value.clone(),
                confidence: element.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                speaker: monologue.speaker.map(|s| s.to_string()),
            });
        }
    }

    let text = segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let confidence = if confidence_count > 0 {
        confidence_sum / confidence_count as f64
    } else {
        DEFAULT_CONFIDENCE
    };

    NormalizedTranscript {
        text,
        segments,
        confidence,
    }
}

pub struct TranscriptionStage {
    provider: Arc<dyn TranscriptionProvider>,
    transcripts: Arc<dyn TranscriptRepository>,
    catalog: Arc<dyn CatalogRepository>,
    notifier: Arc<dyn StageNotifier>,
    producer: Arc<Producer>,
    settings: TranscriptionSettings,
    cancellation_token: CancellationToken,
}

impl TranscriptionStage {
    pub fn new(
        provider: Arc<dyn TranscriptionProvider>,
        transcripts: Arc<dyn TranscriptRepository>,
        catalog: Arc<dyn CatalogRepository>,
        notifier: Arc<dyn StageNotifier>,
        producer: Arc<Producer>,
        settings: TranscriptionSettings,
    ) -> Self {
        Self {
            provider,
            transcripts,
            catalog,
            notifier,
            producer,
            settings,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Abort polling when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }
}

/// Poll `handle` until the provider reports a terminal status or the budget runs out.
async fn wait_for_completion(
    provider: &dyn TranscriptionProvider,
    handle: &str,
    settings: &TranscriptionSettings,
    cancellation_token: &CancellationToken,
) -> Result<()> {
    let max_polls = settings.max_polls();
    let started = Instant::now();

    for attempt in 1..=max_polls {
        match provider.poll_status(handle).await {
            Ok(ProviderJobStatus::Completed) => return Ok(()),
            Ok(ProviderJobStatus::Failed(detail)) => {
                let message = match detail {
                    Some(detail) => format!("transcription failed: {detail}"),
                    None => "transcription failed".to_string(),
                };
                return Err(Error::provider(provider.name(), message));
            }
            Ok(ProviderJobStatus::Cancelled) => {
                return Err(Error::provider(provider.name(), "transcription was cancelled"));
            }
            Ok(ProviderJobStatus::InProgress(status)) => {
                debug!(handle, attempt, %status, "Transcription in progress");
            }
            Err(e) => {
                warn!(handle, attempt, error = %e, "Transcription status poll failed");
            }
        }

        if attempt == max_polls || started.elapsed() >= settings.timeout {
            break;
        }

        tokio::select! {
            _ = cancellation_token.cancelled() => {
                return Err(Error::Other("transcription polling cancelled".to_string()));
            }
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }

    Err(Error::Timeout(format!(
        "transcription did not complete within {}s",
        settings.timeout.as_secs()
    )))
}

#[async_trait]
impl StageHandler for TranscriptionStage {
    fn name(&self) -> &'static str {
        "transcription"
    }

    fn kinds(&self) -> &'static [JobKind] {
        &[JobKind::Transcribe]
    }

    async fn execute(&self, message: &QueueMessage) -> Result<()> {
        let file_path = message
            .file_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::input_missing(format!("job {} has no file path", message.id)))?;

        let started = Instant::now();
        let handle = self.provider.submit(file_path, &message.id).await?;
        info!(job_id = %message.id, handle = %handle, "Submitted audio for transcription");

        wait_for_completion(
            self.provider.as_ref(),
            &handle,
            &self.settings,
            &self.cancellation_token,
        )
        .await?;
        let raw = self.provider.fetch_result(&handle).await?;
        let normalized = normalize_transcript(&raw);

        let transcript = TranscriptDbModel::new(
            &message.audiobook_id,
            message.chapter_id.clone(),
            normalized.text,
            &normalized.segments,
            normalized.confidence,
        )?
        .with_processing_time(started.elapsed().as_secs_f64());
        self.transcripts.save_transcript(&transcript).await?;

        info!(
            job_id = %message.id,
            audiobook_id = %message.audiobook_id,
            segments = normalized.segments.len(),
            confidence = normalized.confidence,
            "Saved transcript"
        );
        Ok(())
    }

    async fn on_completed(&self, message: &QueueMessage) -> Result<()> {
        let Some(chapter_id) = message.chapter_id.as_deref() else {
            return Ok(());
        };

        if self.catalog.is_first_chapter(chapter_id).await? {
            notify_best_effort(self.notifier.as_ref(), &message.audiobook_id).await;
        }

        if self
            .catalog
            .all_chapters_transcribed(&message.audiobook_id)
            .await?
        {
            match self
                .producer
                .create_and_enqueue(&message.audiobook_id, None, JobKind::Embed, None, None)
                .await
            {
                Ok(job) => {
                    info!(audiobook_id = %message.audiobook_id, job_id = %job.id, "Queued embedding")
                }
                Err(Error::Conflict(reason)) => {
                    debug!(audiobook_id = %message.audiobook_id, %reason, "Embedding already queued")
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}
