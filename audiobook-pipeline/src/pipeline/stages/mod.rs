//! Stage handlers and their dispatch table.

pub mod embed;
pub mod response;
pub mod summarize;
pub mod transcribe;

pub use embed::EmbeddingStage;
pub use summarize::SummarizeTagStage;
pub use transcribe::TranscriptionStage;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::Result;
use crate::database::models::{JobKind, TranscriptDbModel};
use crate::database::repositories::{CatalogRepository, TranscriptRepository};
use crate::queue::{InputScope, QueueMessage};

/// Work performed for one claimed message.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Kinds this handler accepts.
    fn kinds(&self) -> &'static [JobKind];

    /// Produce and persist the stage output.
    async fn execute(&self, message: &QueueMessage) -> Result<()>;

    /// Runs after the job was marked completed. Errors are logged by the worker and
    /// never retried.
    async fn on_completed(&self, _message: &QueueMessage) -> Result<()> {
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct StageRegistry {
    handlers: HashMap<JobKind, Arc<dyn StageHandler>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every kind it declares, replacing earlier entries.
    pub fn register(&mut self, handler: Arc<dyn StageHandler>) {
        for kind in handler.kinds() {
            self.handlers.insert(*kind, handler.clone());
        }
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }
}

/// Transcript text selected for a book-level stage.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedText {
    pub text: String,
    pub transcripts: usize,
}

/// Pick the transcript text a stage works from.
///
/// `FirstUnit` reads the first chapter only. `AllUnits` joins chapter transcripts in
/// chapter order with a blank line. Both fall back to an audiobook-level transcript.
pub async fn select_transcript_text(
    catalog: &dyn CatalogRepository,
    transcripts: &dyn TranscriptRepository,
    audiobook_id: &str,
    scope: InputScope,
) -> Result<Option<SelectedText>> {
    let selected: Vec<TranscriptDbModel> = match scope {
        InputScope::FirstUnit => match catalog.first_chapter(audiobook_id).await? {
            Some(first) => transcripts
                .get_transcript(audiobook_id, Some(&first.id))
                .await?
                .into_iter()
                .collect(),
            None => Vec::new(),
        },
        InputScope::AllUnits => transcripts.get_chapter_transcripts(audiobook_id).await?,
    };

    if !selected.is_empty() {
        let text = selected
            .iter()
            .map(|t| t.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        return Ok(Some(SelectedText {
            text,
            transcripts: selected.len(),
        }));
    }

    Ok(transcripts
        .get_transcript(audiobook_id, None)
        .await?
        .map(|t| SelectedText {
            text: t.content,
            transcripts: 1,
        }))
}
