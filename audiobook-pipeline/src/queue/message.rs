//! Queue message: a serialized projection of a job plus delivery metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::database::models::{JobDbModel, JobKind};

/// Priority of freshly produced work.
pub const DEFAULT_PRIORITY: i64 = 1;
/// Priority given to retried work so it is served ahead of fresh work.
pub const ESCALATED_PRIORITY: i64 = 10;
/// Default retry budget of a message.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Metadata key selecting which transcripts a summarize/tag job reads.
pub const SCOPE_KEY: &str = "scope";

/// Which transcripts a text stage consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InputScope {
    /// Only the first chapter's transcript (early-start summaries).
    FirstUnit,
    /// Every chapter transcript in chapter order.
    AllUnits,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    /// Job id.
    pub id: String,
    pub audiobook_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<String>,
    #[serde(rename = "job_type")]
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub priority: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl QueueMessage {
    /// Message for `job` with the producer defaults.
    pub fn for_job(job: &JobDbModel, kind: JobKind) -> Self {
        Self {
            id: job.id.clone(),
            audiobook_id: job.audiobook_id.clone(),
            chapter_id: job.chapter_id.clone(),
            kind,
            file_path: None,
            created_at: Utc::now(),
            priority: DEFAULT_PRIORITY,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            metadata: HashMap::new(),
        }
    }

    pub fn with_file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_scope(self, scope: InputScope) -> Self {
        self.with_metadata(SCOPE_KEY, serde_json::Value::String(scope.to_string()))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Input scope from metadata; anything other than `first_unit` reads all units.
    pub fn scope(&self) -> InputScope {
        match self.metadata.get(SCOPE_KEY).and_then(|v| v.as_str()) {
            Some("first_unit") => InputScope::FirstUnit,
            _ => InputScope::AllUnits,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Ordering score; the lowest score is claimed first.
///
/// Each priority point is worth one second of queue age, so at equal enqueue time the
/// higher priority wins and at equal priority the older message wins.
pub fn score(enqueued_at_ms: i64, priority: i64) -> i64 {
    enqueued_at_ms.saturating_sub(priority.saturating_mul(1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_priority_scores_lower() {
        let t = 1_700_000_000_000;
        assert!(score(t, ESCALATED_PRIORITY) < score(t, DEFAULT_PRIORITY));
        // A retried message enqueued a little later still goes first.
        assert!(score(t + 5_000, ESCALATED_PRIORITY) < score(t, DEFAULT_PRIORITY));
        // Same priority: older first.
        assert!(score(t, DEFAULT_PRIORITY) < score(t + 1, DEFAULT_PRIORITY));
    }

    #[test]
    fn test_wire_format_uses_job_type() {
        let job = JobDbModel::new("book-1", Some("ch-1".into()), JobKind::Transcribe);
        let msg = QueueMessage::for_job(&job, JobKind::Transcribe).with_file_path("audio/ch1.mp3");
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["id"], job.id);
        assert_eq!(json["job_type"], "transcribe");
        assert_eq!(json["file_path"], "audio/ch1.mp3");
        assert_eq!(json["priority"], 1);
        assert_eq!(json["retry_count"], 0);
        assert_eq!(json["max_retries"], 3);
    }

    #[test]
    fn test_scope_defaults_to_all_units() {
        let job = JobDbModel::new("book-1", None, JobKind::Summarize);
        let msg = QueueMessage::for_job(&job, JobKind::Summarize);
        assert_eq!(msg.scope(), InputScope::AllUnits);
        assert_eq!(msg.with_scope(InputScope::FirstUnit).scope(), InputScope::FirstUnit);
    }

    #[test]
    fn test_decodes_minimal_payload() {
        let msg: QueueMessage = serde_json::from_str(
            r#"{"id":"j","audiobook_id":"b","job_type":"embed","created_at":"2025-01-01T00:00:00Z","priority":1,"retry_count":0,"max_retries":3}"#,
        )
        .unwrap();
        assert_eq!(msg.kind, JobKind::Embed);
        assert!(msg.metadata.is_empty());
        assert!(msg.chapter_id.is_none());
    }
}
