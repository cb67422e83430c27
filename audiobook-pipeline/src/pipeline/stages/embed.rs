//! Embedding stage.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::{StageHandler, select_transcript_text};
use crate::database::models::{AiOutputDbModel, JobKind, StageOutput};
use crate::database::repositories::{CatalogRepository, OutputRepository, TranscriptRepository};
use crate::providers::EmbeddingProvider;
use crate::queue::{InputScope, QueueMessage};
use crate::utils::text::truncate_chars;
use crate::{Error, Result};

pub const DEFAULT_EMBEDDING_MAX_CHARS: usize = 1000;
pub const TRANSCRIPT_EMBEDDING: &str = "transcript";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingSettings {
    pub max_chars: usize,
    /// Required vector length, if any.
    pub dimensions: Option<usize>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_EMBEDDING_MAX_CHARS,
            dimensions: None,
        }
    }
}

pub struct EmbeddingStage {
    provider: Arc<dyn EmbeddingProvider>,
    catalog: Arc<dyn CatalogRepository>,
    transcripts: Arc<dyn TranscriptRepository>,
    outputs: Arc<dyn OutputRepository>,
    settings: EmbeddingSettings,
}

impl EmbeddingStage {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        catalog: Arc<dyn CatalogRepository>,
        transcripts: Arc<dyn TranscriptRepository>,
        outputs: Arc<dyn OutputRepository>,
        settings: EmbeddingSettings,
    ) -> Self {
        Self {
            provider,
            catalog,
            transcripts,
            outputs,
            settings,
        }
    }
}

#[async_trait]
impl StageHandler for EmbeddingStage {
    fn name(&self) -> &'static str {
        "embedding"
    }

    fn kinds(&self) -> &'static [JobKind] {
        &[JobKind::Embed]
    }

    async fn execute(&self, message: &QueueMessage) -> Result<()> {
        let selected = select_transcript_text(
            self.catalog.as_ref(),
            self.transcripts.as_ref(),
            &message.audiobook_id,
            InputScope::AllUnits,
        )
        .await?
        .ok_or_else(|| Error::input_missing("No transcripts found for audiobook"))?;

        let text = truncate_chars(&selected.text, self.settings.max_chars, "");
        let started = Instant::now();
        let vector = self.provider.generate_embedding(&text).await?;

        if let Some(expected) = self.settings.dimensions
            && vector.len() != expected
        {
            return Err(Error::provider(
                "embedding",
                format!("expected {expected} dimensions, got {}", vector.len()),
            ));
        }

        let dimensions = vector.len();
        let output = StageOutput::Embedding {
            embedding_type: TRANSCRIPT_EMBEDDING.to_string(),
            vector,
        };
        let row = AiOutputDbModel::new(&message.audiobook_id, &output, self.provider.model())?
            .with_processing_time(started.elapsed().as_secs_f64());
        self.outputs.save_output(&row).await?;

        info!(
            job_id = %message.id,
            audiobook_id = %message.audiobook_id,
            dimensions,
            "Saved embedding"
        );
        Ok(())
    }
}
