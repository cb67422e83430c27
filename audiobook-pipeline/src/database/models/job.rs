//! Job database models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, now_ms};

/// Job database model.
/// One unit of stage work for an audiobook, optionally scoped to a chapter.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct JobDbModel {
    pub id: String,
    pub audiobook_id: String,
    pub chapter_id: Option<String>,
    /// Kind: transcribe, summarize, tag, embed
    pub kind: String,
    /// Status: pending, running, completed, failed
    pub status: String,
    pub error_message: Option<String>,
    pub retry_count: i64,
    /// Epoch milliseconds
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl JobDbModel {
    pub fn new(audiobook_id: impl Into<String>, chapter_id: Option<String>, kind: JobKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            audiobook_id: audiobook_id.into(),
            chapter_id,
            kind: kind.as_str().to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            error_message: None,
            retry_count: 0,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn kind(&self) -> Option<JobKind> {
        JobKind::parse(&self.kind)
    }

    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    /// Whether the timestamp/error fields agree with the status.
    ///
    /// `started_at` is set iff the job left `pending`, `completed_at` iff it is terminal.
    /// A failed job always has an error; running and completed jobs never do. A pending
    /// job may keep the error of the attempt that sent it back to the queue.
    pub fn is_consistent(&self) -> bool {
        let Some(status) = self.status() else {
            return false;
        };
        let started_ok = self.started_at.is_some() == (status != JobStatus::Pending);
        let completed_ok = self.completed_at.is_some() == status.is_terminal();
        let error_ok = match status {
            JobStatus::Failed => self.error_message.is_some(),
            JobStatus::Pending => true,
            JobStatus::Running | JobStatus::Completed => self.error_message.is_none(),
        };
        started_ok && completed_ok && error_ok
    }
}

/// Stage kinds. Each kind owns one queue topic and one stage handler.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Transcribe,
    Summarize,
    Tag,
    Embed,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [Self::Transcribe, Self::Summarize, Self::Tag, Self::Embed];

    pub fn as_str(&self) -> &'static str {
        (*self).into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in a queue topic.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Output persisted.
    Completed,
    /// Attempt failed; the message may still be retried.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        (*self).into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Pending or running.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// A requested status transition, as carried by the job status webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusUpdate {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<i64>,
}

/// Column values a [`JobStatusUpdate`] resolves to against the current row.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStatus {
    pub status: JobStatus,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: i64,
}

impl JobStatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            error_message: None,
            started_at: None,
            completed_at: None,
            retry_count: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            error_message: Some(error_message.into()),
            ..Self::new(JobStatus::Failed)
        }
    }

    pub fn with_retry_count(mut self, retry_count: i64) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Resolve timestamps so the resulting row satisfies [`JobDbModel::is_consistent`].
    ///
    /// `pending` clears every timestamp and keeps only a supplied error, `running` stamps
    /// a fresh `started_at`, terminal states keep an existing `started_at` and stamp
    /// `completed_at`. A failure without a message gets a generic one.
    pub fn resolve(&self, current: &JobDbModel, now: i64) -> ResolvedStatus {
        let started = self.started_at.map(datetime_to_ms);
        let completed = self.completed_at.map(datetime_to_ms);
        let retry_count = self.retry_count.unwrap_or(current.retry_count);

        let (started_at, completed_at, error_message) = match self.status {
            JobStatus::Pending => (
                None,
                None,
                self.error_message.clone().filter(|m| !m.trim().is_empty()),
            ),
            JobStatus::Running => (Some(started.unwrap_or(now)), None, None),
            JobStatus::Completed => (
                Some(started.or(current.started_at).unwrap_or(now)),
                Some(completed.unwrap_or(now)),
                None,
            ),
            JobStatus::Failed => (
                Some(started.or(current.started_at).unwrap_or(now)),
                Some(completed.unwrap_or(now)),
                Some(
                    self.error_message
                        .clone()
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| "unknown error".to_string()),
                ),
            ),
        };

        ResolvedStatus {
            status: self.status,
            started_at,
            completed_at,
            error_message,
            retry_count,
        }
    }
}
