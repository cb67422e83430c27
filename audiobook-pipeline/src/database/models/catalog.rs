//! Catalog models: audiobooks, chapters and the allowed tag vocabulary.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Audiobook database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct AudiobookDbModel {
    pub id: String,
    pub title: String,
    pub created_at: i64,
}

impl AudiobookDbModel {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: now_ms(),
        }
    }
}

/// Chapter database model. A chapter is the structural unit transcription works on.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ChapterDbModel {
    pub id: String,
    pub audiobook_id: String,
    /// 1-based position within the audiobook
    pub chapter_number: i64,
    pub title: String,
    /// Storage reference of the chapter audio
    pub file_path: Option<String>,
    pub created_at: i64,
}

impl ChapterDbModel {
    pub fn new(audiobook_id: impl Into<String>, chapter_number: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            audiobook_id: audiobook_id.into(),
            chapter_number,
            title: format!("Chapter {chapter_number}"),
            file_path: None,
            created_at: now_ms(),
        }
    }

    pub fn with_file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }
}
