//! Stage output repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{AiOutputDbModel, OutputType};
use crate::database::time::now_ms;

#[async_trait]
pub trait OutputRepository: Send + Sync {
    /// Insert or overwrite the output for `(audiobook_id, output_type)`.
    async fn save_output(&self, output: &AiOutputDbModel) -> Result<()>;
    async fn get_output(
        &self,
        audiobook_id: &str,
        output_type: OutputType,
    ) -> Result<Option<AiOutputDbModel>>;
}

pub struct SqlxOutputRepository {
    pool: SqlitePool,
}

impl SqlxOutputRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutputRepository for SqlxOutputRepository {
    async fn save_output(&self, output: &AiOutputDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_output (
                id, audiobook_id, output_type, content, model_used,
                processing_time_seconds, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (audiobook_id, output_type) DO UPDATE SET
                content = excluded.content,
                model_used = excluded.model_used,
                processing_time_seconds = excluded.processing_time_seconds,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&output.id)
        .bind(&output.audiobook_id)
        .bind(&output.output_type)
        .bind(&output.content)
        .bind(&output.model_used)
        .bind(output.processing_time_seconds)
        .bind(output.created_at)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            audiobook_id = %output.audiobook_id,
            output_type = %output.output_type,
            "Saved stage output"
        );
        Ok(())
    }

    async fn get_output(
        &self,
        audiobook_id: &str,
        output_type: OutputType,
    ) -> Result<Option<AiOutputDbModel>> {
        let output = sqlx::query_as::<_, AiOutputDbModel>(
            "SELECT * FROM ai_output WHERE audiobook_id = ? AND output_type = ?",
        )
        .bind(audiobook_id)
        .bind(output_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(output)
    }
}
