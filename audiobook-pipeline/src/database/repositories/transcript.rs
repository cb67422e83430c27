//! Transcript repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::TranscriptDbModel;
use crate::database::time::now_ms;

#[async_trait]
pub trait TranscriptRepository: Send + Sync {
    /// Insert or overwrite the transcript for `(audiobook_id, chapter)`.
    async fn save_transcript(&self, transcript: &TranscriptDbModel) -> Result<()>;
    /// The transcript of one chapter, or the audiobook-level one when `chapter_id` is `None`.
    async fn get_transcript(
        &self,
        audiobook_id: &str,
        chapter_id: Option<&str>,
    ) -> Result<Option<TranscriptDbModel>>;
    /// Chapter transcripts in chapter order.
    async fn get_chapter_transcripts(&self, audiobook_id: &str) -> Result<Vec<TranscriptDbModel>>;
}

pub struct SqlxTranscriptRepository {
    pool: SqlitePool,
}

impl SqlxTranscriptRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TranscriptRepository for SqlxTranscriptRepository {
    async fn save_transcript(&self, transcript: &TranscriptDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transcript (
                id, audiobook_id, chapter_id, chapter_key, content, segments,
                confidence_score, language, processing_time_seconds, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (audiobook_id, chapter_key) DO UPDATE SET
                content = excluded.content,
                segments = excluded.segments,
                confidence_score = excluded.confidence_score,
                language = excluded.language,
                processing_time_seconds = excluded.processing_time_seconds,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&transcript.id)
        .bind(&transcript.audiobook_id)
        .bind(&transcript.chapter_id)
        .bind(&transcript.chapter_key)
        .bind(&transcript.content)
        .bind(&transcript.segments)
        .bind(transcript.confidence_score)
        .bind(&transcript.language)
        .bind(transcript.processing_time_seconds)
        .bind(transcript.created_at)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            audiobook_id = %transcript.audiobook_id,
            chapter_id = ?transcript.chapter_id,
            "Saved transcript"
        );
        Ok(())
    }

    async fn get_transcript(
        &self,
        audiobook_id: &str,
        chapter_id: Option<&str>,
    ) -> Result<Option<TranscriptDbModel>> {
        let transcript = sqlx::query_as::<_, TranscriptDbModel>(
            "SELECT * FROM transcript WHERE audiobook_id = ? AND chapter_key = ?",
        )
        .bind(audiobook_id)
        .bind(chapter_id.unwrap_or_default())
        .fetch_optional(&self.pool)
        .await?;
        Ok(transcript)
    }

    async fn get_chapter_transcripts(&self, audiobook_id: &str) -> Result<Vec<TranscriptDbModel>> {
        let transcripts = sqlx::query_as::<_, TranscriptDbModel>(
            r#"
            SELECT t.* FROM transcript t
            JOIN chapter c ON c.id = t.chapter_key
            WHERE t.audiobook_id = ?
            ORDER BY c.chapter_number
            "#,
        )
        .bind(audiobook_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(transcripts)
    }
}
