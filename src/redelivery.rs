use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::engine::WorkItemSink;
use crate::error::{DispatchError, FailureReason, RedeliveryError};
use crate::hooks::DeliveryHooks;
use crate::queue::{DurableQueue, QueueMessage};
use crate::telemetry::metric_inc;
use crate::types::WorkItem;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    /// Messages claimed per poll.
    pub max_messages: usize,

    /// How long a claimed message stays hidden. Keep it longer than the
    /// engine's full retry schedule, or a message may be claimed again while
    /// its work item is still waiting on a retry tier.
    pub visibility_timeout_ms: u64,

    /// Pause after an empty poll or a failed iteration.
    pub polling_interval_ms: u64,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            max_messages: 32,
            visibility_timeout_ms: 10 * 60 * 1000,
            polling_interval_ms: 10_000,
        }
    }
}

impl RedeliveryConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}

/// Polls a durable queue and resubmits recovered work items for delivery.
///
/// The loop never acknowledges messages itself: pair the engine with
/// [`QueueAckHooks`] so a message is deleted once its work item is delivered
/// or gone. Anything left unacknowledged reappears after the visibility
/// timeout, up to the queue's max dequeue count.
pub struct RedeliveryLoop {
    queue: Arc<dyn DurableQueue>,
    sink: Arc<dyn WorkItemSink>,
    config: RedeliveryConfig,
    started: AtomicBool,
}

impl RedeliveryLoop {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        sink: Arc<dyn WorkItemSink>,
        config: RedeliveryConfig,
    ) -> Self {
        Self {
            queue,
            sink,
            config,
            started: AtomicBool::new(false),
        }
    }

    /// Run until `cancel` fires. Can only be called once per instance.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), RedeliveryError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RedeliveryError::AlreadyStarted);
        }

        tracing::info!(
            target: "webhook_redelivery",
            max_messages = self.config.max_messages,
            polling_interval_ms = self.config.polling_interval_ms,
            "Redelivery loop started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.poll_once() => polled,
            };

            match polled {
                Ok(0) => {}
                Ok(received) => {
                    tracing::debug!(
                        target: "webhook_redelivery",
                        received,
                        "Resubmitted queued work items"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        target: "webhook_redelivery",
                        error = %e,
                        "Redelivery iteration failed"
                    );
                    metric_inc("webhook.redelivery.errors");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.config.polling_interval()) => {}
            }
        }

        tracing::info!(target: "webhook_redelivery", "Redelivery loop stopped");
        Ok(())
    }

    /// Claim one batch and submit it. Returns the number of messages claimed.
    pub async fn poll_once(&self) -> Result<usize, DispatchError> {
        let messages = self
            .queue
            .get_messages(self.config.max_messages, self.config.visibility_timeout())
            .await?;

        let received = messages.len();
        if received == 0 {
            return Ok(0);
        }

        let items: Vec<WorkItem> = messages.into_iter().filter_map(decode_message).collect();
        if !items.is_empty() {
            self.sink.submit(items).await?;
        }
        Ok(received)
    }
}

/// Undecodable messages stay on the queue until its dequeue limit drops them.
fn decode_message(message: QueueMessage) -> Option<WorkItem> {
    match serde_json::from_str::<WorkItem>(&message.body) {
        Ok(mut item) => {
            item.ack_handle = Some(message.handle);
            Some(item)
        }
        Err(e) => {
            tracing::warn!(
                target: "webhook_redelivery",
                message_id = %message.handle.message_id,
                dequeue_count = message.dequeue_count,
                error = %e,
                "Skipping undecodable queue message"
            );
            metric_inc("webhook.redelivery.undecodable");
            None
        }
    }
}

/// Hooks that delete a work item's queue message once it is delivered or gone,
/// then forward to `inner`.
pub struct QueueAckHooks {
    queue: Arc<dyn DurableQueue>,
    inner: Arc<dyn DeliveryHooks>,
}

impl QueueAckHooks {
    pub fn new(queue: Arc<dyn DurableQueue>, inner: Arc<dyn DeliveryHooks>) -> Self {
        Self { queue, inner }
    }

    async fn acknowledge(&self, item: &WorkItem) {
        let Some(handle) = item.ack_handle.as_ref() else {
            return;
        };

        match self.queue.delete_message(handle).await {
            Ok(true) => {
                tracing::debug!(
                    target: "webhook_redelivery",
                    work_item_id = %item.id,
                    message_id = %handle.message_id,
                    "Acknowledged queue message"
                );
            }
            Ok(false) => {
                tracing::warn!(
                    target: "webhook_redelivery",
                    work_item_id = %item.id,
                    message_id = %handle.message_id,
                    "Queue message claim expired before acknowledgment"
                );
            }
            Err(e) => {
                tracing::error!(
                    target: "webhook_redelivery",
                    work_item_id = %item.id,
                    message_id = %handle.message_id,
                    error = %e,
                    "Failed to acknowledge queue message"
                );
            }
        }
    }
}

#[async_trait]
impl DeliveryHooks for QueueAckHooks {
    async fn on_success(&self, item: &WorkItem) {
        self.acknowledge(item).await;
        self.inner.on_success(item).await;
    }

    async fn on_gone(&self, item: &WorkItem) {
        self.acknowledge(item).await;
        self.inner.on_gone(item).await;
    }

    async fn on_retry(&self, item: &WorkItem, reason: &FailureReason) {
        self.inner.on_retry(item, reason).await;
    }

    async fn on_failure(&self, item: &WorkItem, reason: &FailureReason) {
        self.inner.on_failure(item, reason).await;
    }
}
