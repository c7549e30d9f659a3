use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::engine::WorkItemSink;
use crate::error::{DispatchError, QueueError};
use crate::types::{AckHandle, WorkItem};

/// A message claimed from a durable queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub handle: AckHandle,

    /// Serialized work item.
    pub body: String,

    /// How many times this message has been handed out, including this one.
    pub dequeue_count: u32,
}

/// Crash-surviving queue of serialized work items.
///
/// A claimed message stays invisible for `visibility_timeout`. Unless it is
/// deleted in that window it becomes visible again. Messages handed out more
/// than the backend's maximum dequeue count are discarded by the backend.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn add_messages(&self, bodies: Vec<String>) -> Result<(), QueueError>;

    async fn get_messages(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Delete a claimed message. Returns `false` when the claim is stale.
    async fn delete_message(&self, handle: &AckHandle) -> Result<bool, QueueError>;
}

/// Default number of deliveries before a message is discarded.
pub const DEFAULT_MAX_DEQUEUE_COUNT: u32 = 3;

#[derive(Debug)]
struct Entry {
    id: String,
    body: String,
    dequeue_count: u32,
    visible_at: Instant,
    receipt: String,
}

/// In-process queue with visibility timeout and max dequeue count semantics.
///
/// Does not survive restarts; useful for tests and for decoupling producers
/// from the delivery engine inside one process.
pub struct InMemoryQueue {
    entries: Mutex<VecDeque<Entry>>,
    max_dequeue_count: u32,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEQUEUE_COUNT)
    }
}

impl InMemoryQueue {
    pub fn new(max_dequeue_count: u32) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_dequeue_count: max_dequeue_count.max(1),
        }
    }

    /// Messages currently stored, visible or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn add_messages(&self, bodies: Vec<String>) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.extend(bodies.into_iter().map(|body| Entry {
            id: Uuid::new_v4().simple().to_string(),
            body,
            dequeue_count: 0,
            visible_at: now,
            receipt: String::new(),
        }));
        Ok(())
    }

    async fn get_messages(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let mut claimed = Vec::new();

        entries.retain_mut(|entry| {
            if claimed.len() >= max || entry.visible_at > now {
                return true;
            }
            if entry.dequeue_count >= self.max_dequeue_count {
                tracing::warn!(
                    target: "webhook_redelivery",
                    message_id = %entry.id,
                    dequeue_count = entry.dequeue_count,
                    "Discarding message after max dequeue count"
                );
                return false;
            }

            entry.dequeue_count += 1;
            entry.visible_at = now + visibility_timeout;
            entry.receipt = Uuid::new_v4().simple().to_string();
            claimed.push(QueueMessage {
                handle: AckHandle {
                    message_id: entry.id.clone(),
                    receipt: entry.receipt.clone(),
                },
                body: entry.body.clone(),
                dequeue_count: entry.dequeue_count,
            });
            true
        });

        Ok(claimed)
    }

    async fn delete_message(&self, handle: &AckHandle) -> Result<bool, QueueError> {
        let mut entries = self.entries.lock().await;
        let position = entries
            .iter()
            .position(|e| e.id == handle.message_id && e.receipt == handle.receipt);
        Ok(position.and_then(|index| entries.remove(index)).is_some())
    }
}

/// Sink that enqueues work items for a redelivery loop in another process.
pub struct QueueSink {
    queue: Arc<dyn DurableQueue>,
}

impl QueueSink {
    pub fn new(queue: Arc<dyn DurableQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl WorkItemSink for QueueSink {
    async fn submit(&self, items: Vec<WorkItem>) -> Result<(), DispatchError> {
        let bodies = items
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(QueueError::from)?;
        self.queue.add_messages(bodies).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn claimed_messages_are_invisible_until_timeout() {
        let queue = InMemoryQueue::new(3);
        queue.add_messages(vec!["a".into(), "b".into()]).await.unwrap();

        let first = queue.get_messages(10, VISIBILITY).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(queue.get_messages(10, VISIBILITY).await.unwrap().is_empty());

        tokio::time::advance(VISIBILITY + Duration::from_millis(1)).await;
        let again = queue.get_messages(10, VISIBILITY).await.unwrap();
        assert_eq!(again.len(), 2);
        assert!(again.iter().all(|m| m.dequeue_count == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn get_messages_respects_max() {
        let queue = InMemoryQueue::default();
        queue
            .add_messages((0..5).map(|i| i.to_string()).collect())
            .await
            .unwrap();

        let batch = queue.get_messages(2, VISIBILITY).await.unwrap();
        assert_eq!(batch.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(), ["0", "1"]);
        assert_eq!(queue.get_messages(10, VISIBILITY).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_are_discarded_after_max_dequeue_count() {
        let queue = InMemoryQueue::new(2);
        queue.add_messages(vec!["a".into()]).await.unwrap();

        for _ in 0..2 {
            assert_eq!(queue.get_messages(1, VISIBILITY).await.unwrap().len(), 1);
            tokio::time::advance(VISIBILITY + Duration::from_millis(1)).await;
        }

        assert!(queue.get_messages(1, VISIBILITY).await.unwrap().is_empty());
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_receipt_cannot_delete() {
        let queue = InMemoryQueue::default();
        queue.add_messages(vec!["a".into()]).await.unwrap();

        let stale = queue.get_messages(1, VISIBILITY).await.unwrap().remove(0);
        tokio::time::advance(VISIBILITY + Duration::from_millis(1)).await;
        let fresh = queue.get_messages(1, VISIBILITY).await.unwrap().remove(0);

        assert!(!queue.delete_message(&stale.handle).await.unwrap());
        assert!(queue.delete_message(&fresh.handle).await.unwrap());
        assert!(queue.is_empty().await);
    }
}
