use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::types::{SubscriberId, Subscription, SubscriptionId};

/// Caller-supplied narrowing of candidate subscriptions.
///
/// Receives each candidate together with the subscriber that owns it.
pub type SubscriptionPredicate<'a> = &'a (dyn Fn(&Subscription, &SubscriberId) -> bool + Send + Sync);

/// Persistent registration store, keyed by `(subscriber, subscription id)`.
///
/// `query` and `query_all` only return subscriptions that are not paused,
/// match at least one of `actions`, and pass `predicate`.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_all(&self, subscriber: &SubscriberId) -> Result<Vec<Subscription>, StoreError>;

    async fn query(
        &self,
        subscriber: &SubscriberId,
        actions: &[String],
        predicate: SubscriptionPredicate<'_>,
    ) -> Result<Vec<Subscription>, StoreError>;

    async fn query_all(
        &self,
        actions: &[String],
        predicate: SubscriptionPredicate<'_>,
    ) -> Result<Vec<Subscription>, StoreError>;

    async fn lookup(
        &self,
        subscriber: &SubscriberId,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, StoreError>;

    async fn insert(&self, subscriber: &SubscriberId, subscription: &Subscription) -> StoreResult;

    async fn update(&self, subscriber: &SubscriberId, subscription: &Subscription) -> StoreResult;

    async fn delete(&self, subscriber: &SubscriberId, id: &SubscriptionId) -> StoreResult;

    async fn delete_all(&self, subscriber: &SubscriberId) -> StoreResult;
}

/// Shared filter used by every store implementation for `query`/`query_all`.
pub(crate) fn is_candidate(
    subscription: &Subscription,
    subscriber: &SubscriberId,
    actions: &[String],
    predicate: SubscriptionPredicate<'_>,
) -> bool {
    !subscription.is_paused && subscription.matches_any(actions) && predicate(subscription, subscriber)
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    records: RwLock<HashMap<SubscriberId, HashMap<SubscriptionId, Subscription>>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get_all(&self, subscriber: &SubscriberId) -> Result<Vec<Subscription>, StoreError> {
        let guard = self.records.read().await;
        Ok(guard
            .get(subscriber)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn query(
        &self,
        subscriber: &SubscriberId,
        actions: &[String],
        predicate: SubscriptionPredicate<'_>,
    ) -> Result<Vec<Subscription>, StoreError> {
        let guard = self.records.read().await;
        let Some(subs) = guard.get(subscriber) else {
            return Ok(Vec::new());
        };
        Ok(subs
            .values()
            .filter(|s| is_candidate(s, subscriber, actions, predicate))
            .cloned()
            .collect())
    }

    async fn query_all(
        &self,
        actions: &[String],
        predicate: SubscriptionPredicate<'_>,
    ) -> Result<Vec<Subscription>, StoreError> {
        let guard = self.records.read().await;
        Ok(guard
            .iter()
            .flat_map(|(subscriber, subs)| {
                subs.values()
                    .filter(move |s| is_candidate(s, subscriber, actions, predicate))
            })
            .cloned()
            .collect())
    }

    async fn lookup(
        &self,
        subscriber: &SubscriberId,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, StoreError> {
        let guard = self.records.read().await;
        Ok(guard.get(subscriber).and_then(|subs| subs.get(id)).cloned())
    }

    async fn insert(&self, subscriber: &SubscriberId, subscription: &Subscription) -> StoreResult {
        let mut guard = self.records.write().await;
        let subs = guard.entry(subscriber.clone()).or_default();
        if subs.contains_key(&subscription.id) {
            return StoreResult::Conflict;
        }
        subs.insert(subscription.id.clone(), subscription.clone());
        StoreResult::Success
    }

    async fn update(&self, subscriber: &SubscriberId, subscription: &Subscription) -> StoreResult {
        let mut guard = self.records.write().await;
        match guard
            .get_mut(subscriber)
            .and_then(|subs| subs.get_mut(&subscription.id))
        {
            Some(existing) => {
                *existing = subscription.clone();
                StoreResult::Success
            }
            None => StoreResult::NotFound,
        }
    }

    async fn delete(&self, subscriber: &SubscriberId, id: &SubscriptionId) -> StoreResult {
        let mut guard = self.records.write().await;
        match guard.get_mut(subscriber).and_then(|subs| subs.remove(id)) {
            Some(_) => StoreResult::Success,
            None => StoreResult::NotFound,
        }
    }

    async fn delete_all(&self, subscriber: &SubscriberId) -> StoreResult {
        self.records.write().await.remove(subscriber);
        StoreResult::Success
    }
}
