//! SQLite-backed queue.
//!
//! Messages live in `queue_message`. A claim is a single
//! `DELETE ... RETURNING` statement, which SQLite executes atomically.

use async_trait::async_trait;
use sqlx::SqlitePool;

use super::message::score;
use super::{QueueBackend, QueueMessage, Topic};
use crate::Result;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;

pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn decode(payload: Option<(String,)>) -> Result<Option<QueueMessage>> {
        payload
            .map(|(json,)| serde_json::from_str(&json).map_err(Into::into))
            .transpose()
    }
}

#[async_trait]
impl QueueBackend for SqliteQueue {
    async fn enqueue(&self, topic: &Topic, message: &QueueMessage, priority: i64) -> Result<()> {
        let mut message = message.clone();
        message.priority = priority;
        let payload = serde_json::to_string(&message)?;
        let enqueued_at = now_ms();

        retry_on_sqlite_busy("queue.enqueue", || async {
            sqlx::query(
                "INSERT INTO queue_message (topic, job_id, score, payload, enqueued_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(topic.name())
            .bind(&message.id)
            .bind(score(enqueued_at, priority))
            .bind(&payload)
            .bind(enqueued_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;

        tracing::debug!(topic = %topic, job_id = %message.id, priority, "Enqueued message");
        Ok(())
    }

    async fn claim_next(&self, topic: &Topic) -> Result<Option<QueueMessage>> {
        let row: Option<(String,)> = retry_on_sqlite_busy("queue.claim_next", || async {
            Ok(sqlx::query_as(
                r#"
                DELETE FROM queue_message
                WHERE seq = (
                    SELECT seq FROM queue_message
                    WHERE topic = ?
                    ORDER BY score, seq
                    LIMIT 1
                )
                RETURNING payload
                "#,
            )
            .bind(topic.name())
            .fetch_optional(&self.pool)
            .await?)
        })
        .await?;

        Self::decode(row)
    }

    async fn take(&self, topic: &Topic, job_id: &str) -> Result<Option<QueueMessage>> {
        let row: Option<(String,)> = retry_on_sqlite_busy("queue.take", || async {
            Ok(sqlx::query_as(
                r#"
                DELETE FROM queue_message
                WHERE seq = (
                    SELECT seq FROM queue_message
                    WHERE topic = ? AND job_id = ?
                    ORDER BY seq
                    LIMIT 1
                )
                RETURNING payload
                "#,
            )
            .bind(topic.name())
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?)
        })
        .await?;

        Self::decode(row)
    }

    async fn contains(&self, topic: &Topic, job_id: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM queue_message WHERE topic = ? AND job_id = ?)",
        )
        .bind(topic.name())
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn depth(&self, topic: &Topic) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_message WHERE topic = ?")
            .bind(topic.name())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn clear(&self, topic: &Topic) -> Result<u64> {
        let result = sqlx::query("DELETE FROM queue_message WHERE topic = ?")
            .bind(topic.name())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{JobDbModel, JobKind};
    use crate::database::{init_pool_with_size, run_migrations};
    use crate::queue::{DEFAULT_PRIORITY, ESCALATED_PRIORITY, TopicLayout};

    async fn queue() -> SqliteQueue {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteQueue::new(pool)
    }

    fn message(kind: JobKind) -> QueueMessage {
        QueueMessage::for_job(&JobDbModel::new("book", None, kind), kind)
    }

    #[tokio::test]
    async fn test_priority_ten_claimed_before_priority_one() {
        let queue = queue().await;
        let topic = TopicLayout::default().working(JobKind::Summarize);

        let low = message(JobKind::Summarize);
        let high = message(JobKind::Summarize);
        queue.enqueue(&topic, &low, DEFAULT_PRIORITY).await.unwrap();
        queue.enqueue(&topic, &high, ESCALATED_PRIORITY).await.unwrap();

        let first = queue.claim_next(&topic).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(first.priority, ESCALATED_PRIORITY);
        let second = queue.claim_next(&topic).await.unwrap().unwrap();
        assert_eq!(second.id, low.id);
        assert!(queue.claim_next(&topic).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_priority_is_fifo() {
        let queue = queue().await;
        let topic = TopicLayout::default().working(JobKind::Embed);
        let ids: Vec<String> = (0..3)
            .map(|_| message(JobKind::Embed))
            .map(|m| m.id)
            .collect();
        for id in &ids {
            let mut m = message(JobKind::Embed);
            m.id = id.clone();
            queue.enqueue(&topic, &m, DEFAULT_PRIORITY).await.unwrap();
        }

        let claimed = queue.claim_batch(&topic, 10).await.unwrap();
        let claimed_ids: Vec<String> = claimed.into_iter().map(|m| m.id).collect();
        assert_eq!(claimed_ids, ids);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let queue = queue().await;
        let layout = TopicLayout::default();
        let m = message(JobKind::Tag);
        queue
            .enqueue(&layout.working(JobKind::Tag), &m, DEFAULT_PRIORITY)
            .await
            .unwrap();

        assert!(
            queue
                .claim_next(&layout.working(JobKind::Embed))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(queue.depth(&layout.working(JobKind::Tag)).await.unwrap(), 1);
        assert!(
            queue
                .contains(&layout.working(JobKind::Tag), &m.id)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_take_and_clear() {
        let queue = queue().await;
        let dead = TopicLayout::default().dead_letter(JobKind::Summarize);
        let a = message(JobKind::Summarize);
        let b = message(JobKind::Summarize);
        queue.move_to_dead_letter(&dead, &a).await.unwrap();
        queue.move_to_dead_letter(&dead, &b).await.unwrap();

        let taken = queue.take(&dead, &b.id).await.unwrap().unwrap();
        assert_eq!(taken.id, b.id);
        assert!(queue.take(&dead, &b.id).await.unwrap().is_none());

        assert_eq!(queue.clear(&dead).await.unwrap(), 1);
        assert_eq!(queue.depth(&dead).await.unwrap(), 0);
    }
}
