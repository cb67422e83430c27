//! Catalog repository: audiobooks, chapters and the tag vocabulary.
//!
//! The catalog is owned by the API layer; the pipeline reads it to order chapter
//! transcripts and to decide whether a chapter is the first structural unit.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{AudiobookDbModel, ChapterDbModel};
use crate::{Error, Result};

#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn create_audiobook(&self, audiobook: &AudiobookDbModel) -> Result<()>;
    async fn get_audiobook(&self, id: &str) -> Result<AudiobookDbModel>;
    async fn create_chapter(&self, chapter: &ChapterDbModel) -> Result<()>;
    async fn get_chapter(&self, id: &str) -> Result<ChapterDbModel>;
    /// Chapters in `chapter_number` order.
    async fn list_chapters(&self, audiobook_id: &str) -> Result<Vec<ChapterDbModel>>;
    /// The chapter with the lowest number.
    async fn first_chapter(&self, audiobook_id: &str) -> Result<Option<ChapterDbModel>>;
    async fn is_first_chapter(&self, chapter_id: &str) -> Result<bool>;
    /// True when the audiobook has chapters and every one of them has a transcript.
    async fn all_chapters_transcribed(&self, audiobook_id: &str) -> Result<bool>;
    async fn add_allowed_tags(&self, names: &[&str]) -> Result<()>;
    /// Allowed tag vocabulary, sorted by name.
    async fn get_allowed_tags(&self) -> Result<Vec<String>>;
}

pub struct SqlxCatalogRepository {
    pool: SqlitePool,
}

impl SqlxCatalogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogRepository for SqlxCatalogRepository {
    async fn create_audiobook(&self, audiobook: &AudiobookDbModel) -> Result<()> {
        sqlx::query("INSERT INTO audiobook (id, title, created_at) VALUES (?, ?, ?)")
            .bind(&audiobook.id)
            .bind(&audiobook.title)
            .bind(audiobook.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_audiobook(&self, id: &str) -> Result<AudiobookDbModel> {
        sqlx::query_as::<_, AudiobookDbModel>("SELECT * FROM audiobook WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Audiobook", id))
    }

    async fn create_chapter(&self, chapter: &ChapterDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chapter (id, audiobook_id, chapter_number, title, file_path, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chapter.id)
        .bind(&chapter.audiobook_id)
        .bind(chapter.chapter_number)
        .bind(&chapter.title)
        .bind(&chapter.file_path)
        .bind(chapter.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_chapter(&self, id: &str) -> Result<ChapterDbModel> {
        sqlx::query_as::<_, ChapterDbModel>("SELECT * FROM chapter WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Chapter", id))
    }

    async fn list_chapters(&self, audiobook_id: &str) -> Result<Vec<ChapterDbModel>> {
        let chapters = sqlx::query_as::<_, ChapterDbModel>(
            "SELECT * FROM chapter WHERE audiobook_id = ? ORDER BY chapter_number",
        )
        .bind(audiobook_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chapters)
    }

    async fn first_chapter(&self, audiobook_id: &str) -> Result<Option<ChapterDbModel>> {
        let chapter = sqlx::query_as::<_, ChapterDbModel>(
            "SELECT * FROM chapter WHERE audiobook_id = ? ORDER BY chapter_number LIMIT 1",
        )
        .bind(audiobook_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(chapter)
    }

    async fn is_first_chapter(&self, chapter_id: &str) -> Result<bool> {
        let chapter = self.get_chapter(chapter_id).await?;
        let first = self.first_chapter(&chapter.audiobook_id).await?;
        Ok(first.is_some_and(|c| c.id == chapter.id))
    }

    async fn all_chapters_transcribed(&self, audiobook_id: &str) -> Result<bool> {
        let (total, transcribed): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(t.id)
            FROM chapter c
            LEFT JOIN transcript t
              ON t.audiobook_id = c.audiobook_id AND t.chapter_key = c.id
            WHERE c.audiobook_id = ?
            "#,
        )
        .bind(audiobook_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total > 0 && total == transcribed)
    }

    async fn add_allowed_tags(&self, names: &[&str]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for name in names {
            sqlx::query("INSERT OR IGNORE INTO tag (name) VALUES (?)")
                .bind(*name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_allowed_tags(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM tag ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}
