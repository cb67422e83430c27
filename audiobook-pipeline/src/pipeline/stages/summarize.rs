//! Summarize and tag stage.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::response::{filter_valid_tags, parse_summary_and_tags, parse_tag_list};
use super::{StageHandler, select_transcript_text};
use crate::database::models::{AiOutputDbModel, JobKind, StageOutput};
use crate::database::repositories::{CatalogRepository, OutputRepository, TranscriptRepository};
use crate::providers::TextGenerator;
use crate::queue::QueueMessage;
use crate::utils::text::truncate_chars;
use crate::{Error, Result};

/// Longest transcript excerpt sent to the model.
pub const MAX_PROMPT_CHARS: usize = 30_000;

const SUMMARY_TEMPERATURE: f32 = 0.3;
const SUMMARY_MAX_TOKENS: u32 = 1000;
const TAG_TEMPERATURE: f32 = 0.2;
const TAG_MAX_TOKENS: u32 = 100;

pub fn summarize_prompt(transcript: &str, allowed_tags: &[String]) -> String {
    let tags = allowed_tags.join(", ");
    let transcript = truncate_chars(transcript, MAX_PROMPT_CHARS, "...");
    format!(
        r#"Please analyze the following audiobook transcript and provide both a summary and relevant tags.

Requirements:
1. Summary: Provide a concise summary (2-3 paragraphs) focusing on main themes, key events, and important characters.
2. Tags: Choose ONLY from the following available tags: {tags}

IMPORTANT:
- You must ONLY use tags from the provided list. Do not create new tags.
- Respond with ONLY the JSON object, no markdown formatting, no code blocks, no additional text.

Please respond with ONLY this JSON format:
{{
"summary": "Your summary here...",
"tags": ["tag1", "tag2", "tag3"]
}}

Transcript:
{transcript}

Response:"#
    )
}

pub fn tag_prompt(transcript: &str, allowed_tags: &[String]) -> String {
    let tags = allowed_tags.join(", ");
    let transcript = truncate_chars(transcript, MAX_PROMPT_CHARS, "...");
    format!(
        r#"Choose the tags that best describe the following audiobook transcript.

Use ONLY tags from this list: {tags}

Respond with a comma-separated list of tags and nothing else.

Transcript:
{transcript}

Tags:"#
    )
}

pub struct SummarizeTagStage {
    generator: Arc<dyn TextGenerator>,
    catalog: Arc<dyn CatalogRepository>,
    transcripts: Arc<dyn TranscriptRepository>,
    outputs: Arc<dyn OutputRepository>,
}

impl SummarizeTagStage {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        catalog: Arc<dyn CatalogRepository>,
        transcripts: Arc<dyn TranscriptRepository>,
        outputs: Arc<dyn OutputRepository>,
    ) -> Self {
        Self {
            generator,
            catalog,
            transcripts,
            outputs,
        }
    }

    async fn summarize(&self, transcript: &str, allowed: &[String]) -> Result<StageOutput> {
        let response = self
            .generator
            .generate_text(
                &summarize_prompt(transcript, allowed),
                SUMMARY_TEMPERATURE,
                SUMMARY_MAX_TOKENS,
            )
            .await?;

        let (parsed, method) = parse_summary_and_tags(&response);
        debug!(?method, raw_tags = parsed.tags.len(), "Parsed summary response");

        Ok(StageOutput::SummaryWithTags {
            summary: parsed.summary,
            tags: filter_valid_tags(&parsed.tags, allowed),
        })
    }

    async fn tag(&self, transcript: &str, allowed: &[String]) -> Result<StageOutput> {
        let response = self
            .generator
            .generate_text(&tag_prompt(transcript, allowed), TAG_TEMPERATURE, TAG_MAX_TOKENS)
            .await?;

        Ok(StageOutput::Tags {
            tags: filter_valid_tags(&parse_tag_list(&response), allowed),
        })
    }
}

#[async_trait]
impl StageHandler for SummarizeTagStage {
    fn name(&self) -> &'static str {
        "summarize-tag"
    }

    fn kinds(&self) -> &'static [JobKind] {
        &[JobKind::Summarize, JobKind::Tag]
    }

    async fn execute(&self, message: &QueueMessage) -> Result<()> {
        let scope = message.scope();
        let selected = select_transcript_text(
            self.catalog.as_ref(),
            self.transcripts.as_ref(),
            &message.audiobook_id,
            scope,
        )
        .await?
        .ok_or_else(|| Error::input_missing("No transcripts found for audiobook"))?;

        let allowed = self.catalog.get_allowed_tags().await?;
        let started = Instant::now();

        let output = match message.kind {
            JobKind::Summarize => self.summarize(&selected.text, &allowed).await?,
            JobKind::Tag => self.tag(&selected.text, &allowed).await?,
            other => {
                return Err(Error::validation(format!(
                    "{} stage cannot handle {other} jobs",
                    self.name()
                )));
            }
        };

        let row = AiOutputDbModel::new(&message.audiobook_id, &output, self.generator.model())?
            .with_processing_time(started.elapsed().as_secs_f64());
        self.outputs.save_output(&row).await?;

        info!(
            job_id = %message.id,
            audiobook_id = %message.audiobook_id,
            kind = %message.kind,
            %scope,
            transcripts = selected.transcripts,
            "Saved {} output",
            row.output_type
        );
        Ok(())
    }
}
