//! In-process queue backend.
//!
//! Same ordering as [`super::SqliteQueue`], held behind one mutex. Suitable for
//! single-process deployments and tests; contents are lost on restart.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::message::score;
use super::{QueueBackend, QueueMessage, Topic};
use crate::Result;
use crate::database::time::now_ms;

#[derive(Default)]
struct Inner {
    next_seq: u64,
    topics: HashMap<String, BTreeMap<(i64, u64), QueueMessage>>,
}

#[derive(Default)]
pub struct InMemoryQueue {
    inner: Mutex<Inner>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn enqueue(&self, topic: &Topic, message: &QueueMessage, priority: i64) -> Result<()> {
        let mut message = message.clone();
        message.priority = priority;

        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .topics
            .entry(topic.name().to_string())
            .or_default()
            .insert((score(now_ms(), priority), seq), message);
        Ok(())
    }

    async fn claim_next(&self, topic: &Topic) -> Result<Option<QueueMessage>> {
        let mut inner = self.inner.lock();
        Ok(inner
            .topics
            .get_mut(topic.name())
            .and_then(|messages| messages.pop_first())
            .map(|(_, message)| message))
    }

    async fn take(&self, topic: &Topic, job_id: &str) -> Result<Option<QueueMessage>> {
        let mut inner = self.inner.lock();
        let Some(messages) = inner.topics.get_mut(topic.name()) else {
            return Ok(None);
        };
        let key = messages
            .iter()
            .find(|(_, m)| m.id == job_id)
            .map(|(key, _)| *key);
        Ok(key.and_then(|key| messages.remove(&key)))
    }

    async fn contains(&self, topic: &Topic, job_id: &str) -> Result<bool> {
        let inner = self.inner.lock();
        Ok(inner
            .topics
            .get(topic.name())
            .is_some_and(|messages| messages.values().any(|m| m.id == job_id)))
    }

    async fn depth(&self, topic: &Topic) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .topics
            .get(topic.name())
            .map_or(0, |messages| messages.len() as u64))
    }

    async fn clear(&self, topic: &Topic) -> Result<u64> {
        let mut inner = self.inner.lock();
        Ok(inner
            .topics
            .remove(topic.name())
            .map_or(0, |messages| messages.len() as u64))
    }
}
