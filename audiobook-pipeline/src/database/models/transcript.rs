//! Transcript database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// One timed span of recognized speech.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub confidence: f64,
    #[serde(default)]
    pub speaker: Option<String>,
}

/// Transcript database model. `chapter_key` is the chapter id, or empty for an
/// audiobook-level transcript; it is the upsert key together with `audiobook_id`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct TranscriptDbModel {
    pub id: String,
    pub audiobook_id: String,
    pub chapter_id: Option<String>,
    pub chapter_key: String,
    pub content: String,
    /// JSON array of [`TranscriptSegment`]
    pub segments: String,
    pub confidence_score: f64,
    pub language: String,
    pub processing_time_seconds: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TranscriptDbModel {
    pub fn new(
        audiobook_id: impl Into<String>,
        chapter_id: Option<String>,
        content: impl Into<String>,
        segments: &[TranscriptSegment],
        confidence_score: f64,
    ) -> crate::Result<Self> {
        let now = now_ms();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            audiobook_id: audiobook_id.into(),
            chapter_key: chapter_id.clone().unwrap_or_default(),
            chapter_id,
            content: content.into(),
            segments: serde_json::to_string(segments)?,
            confidence_score,
            language: "en".to_string(),
            processing_time_seconds: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_processing_time(mut self, seconds: f64) -> Self {
        self.processing_time_seconds = Some(seconds);
        self
    }

    pub fn get_segments(&self) -> Vec<TranscriptSegment> {
        serde_json::from_str(&self.segments).unwrap_or_default()
    }
}
