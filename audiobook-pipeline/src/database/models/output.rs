//! Stage output models.
//!
//! Outputs are persisted as a JSON `content` column keyed by `(audiobook_id, output_type)`.
//! The content is always a [`StageOutput`] variant, checked by [`StageOutput::validate`]
//! before it reaches the store.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::{Error, Result};

/// Output type column values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Summary,
    Tags,
    Embedding,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Tags => "tags",
            Self::Embedding => "embedding",
        }
    }
}

/// Typed stage output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageOutput {
    SummaryWithTags { summary: String, tags: Vec<String> },
    Tags { tags: Vec<String> },
    Embedding { embedding_type: String, vector: Vec<f64> },
}

impl StageOutput {
    pub fn output_type(&self) -> OutputType {
        match self {
            Self::SummaryWithTags { .. } => OutputType::Summary,
            Self::Tags { .. } => OutputType::Tags,
            Self::Embedding { .. } => OutputType::Embedding,
        }
    }

    pub fn validate(&self) -> Result<()> {
        fn check_tags(tags: &[String]) -> Result<()> {
            if tags.iter().any(|t| t.trim().is_empty()) {
                return Err(Error::validation("tags must be non-empty strings"));
            }
            Ok(())
        }

        match self {
            Self::SummaryWithTags { summary, tags } => {
                if summary.trim().is_empty() {
                    return Err(Error::validation("summary must not be empty"));
                }
                check_tags(tags)
            }
            Self::Tags { tags } => check_tags(tags),
            Self::Embedding {
                embedding_type,
                vector,
            } => {
                if embedding_type.trim().is_empty() {
                    return Err(Error::validation("embedding type must not be empty"));
                }
                if vector.is_empty() {
                    return Err(Error::validation("embedding vector must not be empty"));
                }
                if vector.iter().any(|v| !v.is_finite()) {
                    return Err(Error::validation("embedding vector contains non-finite values"));
                }
                Ok(())
            }
        }
    }
}

/// AI output database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct AiOutputDbModel {
    pub id: String,
    pub audiobook_id: String,
    pub output_type: String,
    /// JSON-serialized [`StageOutput`]
    pub content: String,
    pub model_used: String,
    pub processing_time_seconds: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AiOutputDbModel {
    /// Validate `output` and build a row for it.
    pub fn new(
        audiobook_id: impl Into<String>,
        output: &StageOutput,
        model_used: impl Into<String>,
    ) -> Result<Self> {
        output.validate()?;
        let now = now_ms();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            audiobook_id: audiobook_id.into(),
            output_type: output.output_type().as_str().to_string(),
            content: serde_json::to_string(output)?,
            model_used: model_used.into(),
            processing_time_seconds: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_processing_time(mut self, seconds: f64) -> Self {
        self.processing_time_seconds = Some(seconds);
        self
    }

    pub fn get_output(&self) -> Result<StageOutput> {
        Ok(serde_json::from_str(&self.content)?)
    }
}
