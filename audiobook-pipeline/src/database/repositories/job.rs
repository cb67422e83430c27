//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{JobDbModel, JobKind, JobStatus, JobStatusUpdate};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    async fn get_pending_jobs(&self, kind: JobKind, limit: i64) -> Result<Vec<JobDbModel>>;
    /// Shorthand for [`JobRepository::apply_status_update`] with only a status and error.
    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()>;
    async fn apply_status_update(&self, id: &str, update: &JobStatusUpdate) -> Result<()>;
    /// Back to `pending` with timestamps and error cleared, recording `retry_count`.
    async fn reset_to_pending(&self, id: &str, retry_count: i64) -> Result<()> {
        self.apply_status_update(
            id,
            &JobStatusUpdate::new(JobStatus::Pending).with_retry_count(retry_count),
        )
        .await
    }
    /// The pending or running job for `(audiobook, chapter, kind)`, if any.
    async fn find_active_job(
        &self,
        audiobook_id: &str,
        chapter_id: Option<&str>,
        kind: JobKind,
    ) -> Result<Option<JobDbModel>>;
    async fn list_jobs_for_audiobook(&self, audiobook_id: &str) -> Result<Vec<JobDbModel>>;
    /// Fail `running` jobs of `kind` whose `started_at` is older than `started_before_ms`.
    async fn fail_stale_running(
        &self,
        kind: JobKind,
        started_before_ms: i64,
        error_message: &str,
    ) -> Result<u64>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO job (id, audiobook_id, chapter_id, kind, status, error_message,
                             retry_count, created_at, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.audiobook_id)
        .bind(&job.chapter_id)
        .bind(&job.kind)
        .bind(&job.status)
        .bind(&job.error_message)
        .bind(job.retry_count)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(Error::conflict(format!(
                    "an active {} job already exists for audiobook {}",
                    job.kind, job.audiobook_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn get_pending_jobs(&self, kind: JobKind, limit: i64) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE kind = ? AND status = 'pending' ORDER BY created_at LIMIT ?",
        )
        .bind(kind.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut update = JobStatusUpdate::new(status);
        update.error_message = error_message.map(str::to_string);
        self.apply_status_update(id, &update).await
    }

    async fn apply_status_update(&self, id: &str, update: &JobStatusUpdate) -> Result<()> {
        let current = self.get_job(id).await?;
        let resolved = update.resolve(&current, now_ms());

        retry_on_sqlite_busy("job.apply_status_update", || async {
            sqlx::query(
                r#"
                UPDATE job SET
                    status = ?,
                    started_at = ?,
                    completed_at = ?,
                    error_message = ?,
                    retry_count = ?
                WHERE id = ?
                "#,
            )
            .bind(resolved.status.as_str())
            .bind(resolved.started_at)
            .bind(resolved.completed_at)
            .bind(&resolved.error_message)
            .bind(resolved.retry_count)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
        .map_err(|e| match e {
            Error::DatabaseSqlx(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                Error::conflict(format!(
                    "another active {} job exists for audiobook {}",
                    current.kind, current.audiobook_id
                ))
            }
            other => other,
        })?;

        tracing::debug!(job_id = %id, status = %resolved.status, "Updated job status");
        Ok(())
    }

    async fn find_active_job(
        &self,
        audiobook_id: &str,
        chapter_id: Option<&str>,
        kind: JobKind,
    ) -> Result<Option<JobDbModel>> {
        let job = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM job
            WHERE audiobook_id = ?
              AND COALESCE(chapter_id, '') = ?
              AND kind = ?
              AND status IN ('pending', 'running')
            LIMIT 1
            "#,
        )
        .bind(audiobook_id)
        .bind(chapter_id.unwrap_or_default())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn list_jobs_for_audiobook(&self, audiobook_id: &str) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE audiobook_id = ? ORDER BY created_at, id",
        )
        .bind(audiobook_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn fail_stale_running(
        &self,
        kind: JobKind,
        started_before_ms: i64,
        error_message: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE job SET status = 'failed', completed_at = ?, error_message = ?
            WHERE kind = ? AND status = 'running' AND started_at < ?
            "#,
        )
        .bind(now_ms())
        .bind(error_message)
        .bind(kind.as_str())
        .bind(started_before_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
