use async_trait::async_trait;

use crate::error::FailureReason;
use crate::types::WorkItem;

/// Callbacks invoked by the delivery engine as work items change state.
///
/// Every method defaults to a no-op. Implementations may react to outcomes,
/// e.g. pause a subscription in the store when its endpoint reports `410 Gone`;
/// the engine itself never touches the store.
///
/// Hooks run on the tier worker that produced the outcome, so slow hooks
/// reduce that tier's throughput.
#[async_trait]
pub trait DeliveryHooks: Send + Sync {
    /// The subscriber accepted the callback with a 2xx status.
    async fn on_success(&self, _item: &WorkItem) {}

    /// The subscriber answered `410 Gone`. No further attempts are made.
    async fn on_gone(&self, _item: &WorkItem) {}

    /// The attempt failed and `item` has been scheduled on its next tier.
    /// `item.attempt` already holds the incremented counter.
    async fn on_retry(&self, _item: &WorkItem, _reason: &FailureReason) {}

    /// The last tier failed; the item is abandoned.
    async fn on_failure(&self, _item: &WorkItem, _reason: &FailureReason) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl DeliveryHooks for NoopHooks {}
