//! Failure handling for claimed messages.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::status::JobStatusReporter;
use crate::database::models::JobKind;
use crate::queue::{
    DEFAULT_MAX_RETRIES, ESCALATED_PRIORITY, QueueBackend, QueueMessage, Topic, TopicLayout,
};
use crate::{Error, Result};

/// Retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before a message is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Priority given to retried messages.
    #[serde(default = "default_escalated_priority")]
    pub escalated_priority: i64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_escalated_priority() -> i64 {
    ESCALATED_PRIORITY
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            escalated_priority: default_escalated_priority(),
        }
    }
}

/// What happened to a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Requeued { retry_count: u32, priority: i64 },
    DeadLettered { retry_count: u32 },
}

impl RetryDecision {
    pub fn retry_count(&self) -> u32 {
        match self {
            Self::Requeued { retry_count, .. } | Self::DeadLettered { retry_count } => *retry_count,
        }
    }
}

impl RetryPolicy {
    /// Decide the fate of `message` after one more failed attempt.
    ///
    /// The message's own `max_retries` is the budget; the policy only supplies the
    /// priority boost.
    pub fn decide(&self, message: &QueueMessage) -> RetryDecision {
        let next = message.retry_count.saturating_add(1);
        if next < message.max_retries {
            RetryDecision::Requeued {
                retry_count: next,
                priority: self.escalated_priority,
            }
        } else {
            RetryDecision::DeadLettered {
                retry_count: next.min(message.max_retries),
            }
        }
    }
}

pub struct RetryCoordinator {
    queue: Arc<dyn QueueBackend>,
    layout: TopicLayout,
    status: Arc<dyn JobStatusReporter>,
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        layout: TopicLayout,
        status: Arc<dyn JobStatusReporter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            layout,
            status,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Requeue or dead-letter a failed message, recording the outcome on the job.
    ///
    /// A requeued job goes straight from `running` to `pending`, so it never drops out of
    /// the active set. Status reporting errors are logged; only queue errors are
    /// returned, since a lost message cannot be recovered from the job record alone.
    pub async fn handle_failure(&self, mut message: QueueMessage, error: &str) -> Result<RetryDecision> {
        let decision = self.policy.decide(&message);
        let retry_count = decision.retry_count();

        message.retry_count = retry_count;
        match decision {
            RetryDecision::Requeued { priority, .. } => {
                message.priority = priority;
                if let Err(e) = self.status.requeue_pending(&message.id, error, retry_count).await {
                    warn!(job_id = %message.id, error = %e, "Failed to return job to pending");
                }
                self.queue
                    .requeue(&self.layout.working(message.kind), &message, priority)
                    .await?;
                info!(
                    job_id = %message.id,
                    kind = %message.kind,
                    attempt = retry_count,
                    max = message.max_retries,
                    error = %error,
                    "Requeued failed job"
                );
            }
            RetryDecision::DeadLettered { .. } => {
                if let Err(e) = self.status.mark_failed(&message.id, error, retry_count).await {
                    warn!(job_id = %message.id, error = %e, "Failed to record job failure");
                }
                self.queue
                    .move_to_dead_letter(&self.layout.dead_letter(message.kind), &message)
                    .await?;
                warn!(
                    job_id = %message.id,
                    kind = %message.kind,
                    attempts = retry_count,
                    error = %error,
                    "Job exhausted its retries, moved to failed queue"
                );
            }
        }

        Ok(decision)
    }

    /// Move a dead-lettered message back onto its working topic with a fresh budget.
    ///
    /// If the job cannot be reset or the message cannot be queued, the message goes
    /// back to the failed queue untouched and the error is returned.
    pub async fn retry_dead_letter(&self, kind: JobKind, job_id: &str) -> Result<QueueMessage> {
        let dead_letter = self.layout.dead_letter(kind);
        let parked = self
            .queue
            .take(&dead_letter, job_id)
            .await?
            .ok_or_else(|| Error::not_found("job in failed queue", job_id))?;

        let mut message = parked.clone();
        message.retry_count = 0;
        message.priority = self.policy.escalated_priority;

        if let Err(e) = self.status.reset_pending(&message.id, 0).await {
            self.restore_dead_letter(&dead_letter, &parked).await;
            return Err(e);
        }

        if let Err(e) = self
            .queue
            .enqueue(&self.layout.working(kind), &message, message.priority)
            .await
        {
            let reason = format!("manual retry could not be queued: {e}");
            if let Err(report) = self
                .status
                .mark_failed(&message.id, &reason, parked.retry_count)
                .await
            {
                warn!(job_id = %job_id, error = %report, "Failed to restore job failure");
            }
            self.restore_dead_letter(&dead_letter, &parked).await;
            return Err(e);
        }

        info!(job_id = %job_id, kind = %kind, "Manually retried failed job");
        Ok(message)
    }

    async fn restore_dead_letter(&self, dead_letter: &Topic, message: &QueueMessage) {
        match self.queue.move_to_dead_letter(dead_letter, message).await {
            Ok(()) => debug!(job_id = %message.id, "Returned message to failed queue"),
            Err(e) => error!(
                job_id = %message.id,
                error = %e,
                "Failed to return message to failed queue"
            ),
        }
    }
}
