//! Stage producer: turns job records into queue messages.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use crate::database::models::{JobDbModel, JobKind, JobStatus};
use crate::database::repositories::JobRepository;
use crate::queue::{DEFAULT_PRIORITY, InputScope, QueueBackend, QueueMessage, TopicLayout};
use crate::{Error, Result};

pub struct Producer {
    jobs: Arc<dyn JobRepository>,
    queue: Arc<dyn QueueBackend>,
    layout: TopicLayout,
    policy: RetryPolicy,
}

impl Producer {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        queue: Arc<dyn QueueBackend>,
        layout: TopicLayout,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            jobs,
            queue,
            layout,
            policy,
        }
    }

    /// Build the initial message for `job` on the `kind` topic.
    pub fn message_for(&self, job: &JobDbModel, kind: JobKind, file_ref: Option<&str>) -> Result<QueueMessage> {
        if job.audiobook_id.trim().is_empty() {
            return Err(Error::validation(format!("job {} has no audiobook", job.id)));
        }
        if job.kind() != Some(kind) {
            return Err(Error::validation(format!(
                "job {} is a {} job, not {}",
                job.id, job.kind, kind
            )));
        }

        let mut message = QueueMessage::for_job(job, kind).with_max_retries(self.policy.max_retries);
        if let Some(file_ref) = file_ref.filter(|f| !f.trim().is_empty()) {
            message = message.with_file_path(file_ref);
        }
        Ok(message)
    }

    /// Enqueue an existing job record with default priority.
    pub async fn enqueue_stage(
        &self,
        job: &JobDbModel,
        kind: JobKind,
        file_ref: Option<&str>,
    ) -> Result<QueueMessage> {
        let message = self.message_for(job, kind, file_ref)?;
        self.enqueue(&message).await?;
        Ok(message)
    }

    /// Enqueue a prepared message, refusing a second in-flight copy of the same job.
    pub async fn enqueue(&self, message: &QueueMessage) -> Result<()> {
        let topic = self.layout.working(message.kind);
        if self.queue.contains(&topic, &message.id).await? {
            return Err(Error::conflict(format!(
                "job {} is already queued on {}",
                message.id, topic
            )));
        }

        self.queue.enqueue(&topic, message, DEFAULT_PRIORITY).await?;
        debug!(
            job_id = %message.id,
            kind = %message.kind,
            audiobook_id = %message.audiobook_id,
            "Enqueued stage"
        );
        Ok(())
    }

    /// Create a job record and enqueue it.
    ///
    /// Fails with [`Error::Conflict`] when a pending or running job already exists
    /// for the same audiobook, chapter and kind.
    pub async fn create_and_enqueue(
        &self,
        audiobook_id: &str,
        chapter_id: Option<&str>,
        kind: JobKind,
        file_ref: Option<&str>,
        scope: Option<InputScope>,
    ) -> Result<JobDbModel> {
        if let Some(active) = self.jobs.find_active_job(audiobook_id, chapter_id, kind).await? {
            return Err(Error::conflict(format!(
                "{} job {} is already {} for audiobook {}",
                kind, active.id, active.status, audiobook_id
            )));
        }

        let job = JobDbModel::new(audiobook_id, chapter_id.map(str::to_string), kind);
        self.jobs.create_job(&job).await?;

        let mut message = self.message_for(&job, kind, file_ref)?;
        if let Some(scope) = scope {
            message = message.with_scope(scope);
        }

        if let Err(e) = self.enqueue(&message).await {
            warn!(job_id = %job.id, error = %e, "Failed to enqueue new job");
            let reason = format!("failed to enqueue: {e}");
            if let Err(update_err) = self
                .jobs
                .update_job_status(&job.id, JobStatus::Failed, Some(&reason))
                .await
            {
                warn!(job_id = %job.id, error = %update_err, "Failed to mark unqueued job as failed");
            }
            return Err(e);
        }

        info!(
            job_id = %job.id,
            kind = %kind,
            audiobook_id = %audiobook_id,
            "Created and enqueued job"
        );
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::AudiobookDbModel;
    use crate::database::repositories::{CatalogRepository, SqlxCatalogRepository, SqlxJobRepository};
    use crate::database::{init_pool_with_size, run_migrations};
    use crate::queue::InMemoryQueue;

    async fn producer() -> (Producer, Arc<dyn JobRepository>, Arc<InMemoryQueue>, String) {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let book = AudiobookDbModel::new("The Long Walk");
        SqlxCatalogRepository::new(pool.clone())
            .create_audiobook(&book)
            .await
            .unwrap();
        let jobs: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(pool));
        let queue = Arc::new(InMemoryQueue::new());
        let producer = Producer::new(
            jobs.clone(),
            queue.clone(),
            TopicLayout::default(),
            RetryPolicy::default(),
        );
        (producer, jobs, queue, book.id)
    }

    #[tokio::test]
    async fn test_enqueue_stage_defaults() {
        let (producer, _, queue, _) = producer().await;
        let job = JobDbModel::new("book", Some("ch".into()), JobKind::Transcribe);

        let msg = producer
            .enqueue_stage(&job, JobKind::Transcribe, Some("s3://bucket/ch1.mp3"))
            .await
            .unwrap();
        assert_eq!(msg.priority, 1);
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.max_retries, 3);
        assert_eq!(msg.file_path.as_deref(), Some("s3://bucket/ch1.mp3"));

        let topic = TopicLayout::default().working(JobKind::Transcribe);
        assert!(queue.contains(&topic, &job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_message_is_conflict() {
        let (producer, _, _, _) = producer().await;
        let job = JobDbModel::new("book", None, JobKind::Embed);

        producer.enqueue_stage(&job, JobKind::Embed, None).await.unwrap();
        let err = producer
            .enqueue_stage(&job, JobKind::Embed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_mismatched_kind_and_missing_audiobook_are_rejected() {
        let (producer, _, _, _) = producer().await;
        let job = JobDbModel::new("book", None, JobKind::Tag);
        assert!(matches!(
            producer.enqueue_stage(&job, JobKind::Summarize, None).await,
            Err(Error::Validation(_))
        ));

        let orphan = JobDbModel::new("", None, JobKind::Tag);
        assert!(matches!(
            producer.enqueue_stage(&orphan, JobKind::Tag, None).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_and_enqueue_refuses_active_duplicate() {
        let (producer, jobs, queue, book) = producer().await;

        let job = producer
            .create_and_enqueue(&book, None, JobKind::Summarize, None, Some(InputScope::FirstUnit))
            .await
            .unwrap();
        assert_eq!(jobs.get_job(&job.id).await.unwrap().status(), Some(JobStatus::Pending));

        let claimed = queue
            .claim_next(&TopicLayout::default().working(JobKind::Summarize))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.scope(), InputScope::FirstUnit);

        let err = producer
            .create_and_enqueue(&book, None, JobKind::Summarize, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        jobs.update_job_status(&job.id, JobStatus::Running, None).await.unwrap();
        jobs.update_job_status(&job.id, JobStatus::Completed, None).await.unwrap();
        producer
            .create_and_enqueue(&book, None, JobKind::Summarize, None, None)
            .await
            .unwrap();
    }
}
