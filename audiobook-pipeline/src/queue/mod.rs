//! Priority queue backend.
//!
//! One working topic per job kind (`{prefix}:queue:{kind}`) plus a dead-letter topic
//! (`{prefix}:failed:{kind}`) for messages whose retry budget is exhausted. Messages
//! are ordered by [`message::score`]; claiming is an atomic remove-and-return so two
//! workers polling the same topic never receive the same message.

pub mod memory;
pub mod message;
pub mod sqlite;

pub use memory::InMemoryQueue;
pub use message::{
    DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, ESCALATED_PRIORITY, InputScope, QueueMessage,
};
pub use sqlite::SqliteQueue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Result;
use crate::database::models::JobKind;

/// Default topic prefix.
pub const DEFAULT_PREFIX: &str = "audiobooks";

/// A named, ordered message collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives topic names from a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    prefix: String,
}

impl TopicLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn working(&self, kind: JobKind) -> Topic {
        Topic(format!("{}:queue:{}", self.prefix, kind.as_str()))
    }

    pub fn dead_letter(&self, kind: JobKind) -> Topic {
        Topic(format!("{}:failed:{}", self.prefix, kind.as_str()))
    }
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Add `message` to `topic` with `priority`, stamped with the current time.
    async fn enqueue(&self, topic: &Topic, message: &QueueMessage, priority: i64) -> Result<()>;

    /// Atomically remove and return the lowest-scored message.
    async fn claim_next(&self, topic: &Topic) -> Result<Option<QueueMessage>>;

    /// Remove and return the message for `job_id`, wherever it sits in the topic.
    async fn take(&self, topic: &Topic, job_id: &str) -> Result<Option<QueueMessage>>;

    async fn contains(&self, topic: &Topic, job_id: &str) -> Result<bool>;

    async fn depth(&self, topic: &Topic) -> Result<u64>;

    /// Drop every message in `topic`, returning how many were removed.
    async fn clear(&self, topic: &Topic) -> Result<u64>;

    /// Park an exhausted message on a dead-letter topic.
    async fn move_to_dead_letter(&self, dead_letter: &Topic, message: &QueueMessage) -> Result<()> {
        self.enqueue(dead_letter, message, message.priority).await
    }

    /// Put `message` back on `topic` with a fresh enqueue time and `new_priority`.
    async fn requeue(&self, topic: &Topic, message: &QueueMessage, new_priority: i64) -> Result<()> {
        self.enqueue(topic, message, new_priority).await
    }

    /// Claim up to `limit` messages, stopping early when the topic runs dry.
    async fn claim_batch(&self, topic: &Topic, limit: usize) -> Result<Vec<QueueMessage>> {
        let mut claimed = Vec::with_capacity(limit);
        while claimed.len() < limit {
            match self.claim_next(topic).await? {
                Some(message) => claimed.push(message),
                None => break,
            }
        }
        Ok(claimed)
    }
}

/// Per-kind queue depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub kind: JobKind,
    pub pending: u64,
    pub failed: u64,
}

/// Depths of the working and dead-letter topics of `kind`.
pub async fn queue_stats(
    backend: &dyn QueueBackend,
    layout: &TopicLayout,
    kind: JobKind,
) -> Result<QueueStats> {
    Ok(QueueStats {
        kind,
        pending: backend.depth(&layout.working(kind)).await?,
        failed: backend.depth(&layout.dead_letter(kind)).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        let layout = TopicLayout::default();
        assert_eq!(
            layout.working(JobKind::Transcribe).name(),
            "audiobooks:queue:transcribe"
        );
        assert_eq!(
            layout.dead_letter(JobKind::Summarize).to_string(),
            "audiobooks:failed:summarize"
        );

        let custom = TopicLayout::new("staging");
        assert_eq!(custom.working(JobKind::Embed).name(), "staging:queue:embed");
    }
}
