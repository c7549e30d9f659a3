use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::{StoreError, StoreResult};
use crate::storage::{is_candidate, SubscriptionPredicate, SubscriptionStore};
use crate::types::{SubscriberId, Subscription, SubscriptionId};

/// Redis-backed store: one hash per subscriber, `id -> JSON subscription`.
pub struct RedisSubscriptionStore {
    client: redis::Client,
    prefix: String,
}

impl RedisSubscriptionStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn key_prefix(&self) -> String {
        format!("{}:subscriptions:", self.prefix)
    }

    fn subscriber_key(&self, subscriber: &SubscriberId) -> String {
        format!("{}{}", self.key_prefix(), subscriber.0)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        self.client
            .get_tokio_connection()
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))
    }

    async fn load(&self, key: &str) -> Result<Vec<Subscription>, StoreError> {
        let mut conn = self.connection().await?;
        let values: Vec<String> = conn
            .hvals(key)
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;
        Ok(values.iter().filter_map(|v| decode(v)).collect())
    }
}

fn decode(value: &str) -> Option<Subscription> {
    match serde_json::from_str::<Subscription>(value) {
        Ok(subscription) => Some(subscription),
        Err(e) => {
            tracing::warn!(
                target: "webhook_dispatch",
                error = %e,
                "Skipping undecodable subscription record"
            );
            None
        }
    }
}

fn operation_failed(operation: &'static str, err: redis::RedisError) -> StoreResult {
    tracing::error!(
        target: "webhook_dispatch",
        operation,
        error = %err,
        "Redis subscription store operation failed"
    );
    StoreResult::OperationError
}

#[async_trait]
impl SubscriptionStore for RedisSubscriptionStore {
    async fn get_all(&self, subscriber: &SubscriberId) -> Result<Vec<Subscription>, StoreError> {
        self.load(&self.subscriber_key(subscriber)).await
    }

    async fn query(
        &self,
        subscriber: &SubscriberId,
        actions: &[String],
        predicate: SubscriptionPredicate<'_>,
    ) -> Result<Vec<Subscription>, StoreError> {
        let all = self.load(&self.subscriber_key(subscriber)).await?;
        Ok(all
            .into_iter()
            .filter(|s| is_candidate(s, subscriber, actions, predicate))
            .collect())
    }

    async fn query_all(
        &self,
        actions: &[String],
        predicate: SubscriptionPredicate<'_>,
    ) -> Result<Vec<Subscription>, StoreError> {
        let key_prefix = self.key_prefix();
        let keys: Vec<String> = {
            let mut conn = self.connection().await?;
            conn.keys(format!("{key_prefix}*"))
                .await
                .map_err(|e| StoreError::Operation(e.to_string()))?
        };

        let mut matches = Vec::new();
        for key in keys {
            let Some(subscriber) = key.strip_prefix(&key_prefix) else {
                continue;
            };
            let subscriber = SubscriberId(subscriber.to_string());
            matches.extend(
                self.load(&key)
                    .await?
                    .into_iter()
                    .filter(|s| is_candidate(s, &subscriber, actions, predicate)),
            );
        }
        Ok(matches)
    }

    async fn lookup(
        &self,
        subscriber: &SubscriberId,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn
            .hget(self.subscriber_key(subscriber), &id.0)
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;
        Ok(value.as_deref().and_then(decode))
    }

    async fn insert(&self, subscriber: &SubscriberId, subscription: &Subscription) -> StoreResult {
        let Ok(payload) = serde_json::to_string(subscription) else {
            return StoreResult::InternalError;
        };
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(_) => return StoreResult::OperationError,
        };

        let inserted: Result<bool, _> = conn
            .hset_nx(self.subscriber_key(subscriber), &subscription.id.0, payload)
            .await;
        match inserted {
            Ok(true) => StoreResult::Success,
            Ok(false) => StoreResult::Conflict,
            Err(e) => operation_failed("insert", e),
        }
    }

    async fn update(&self, subscriber: &SubscriberId, subscription: &Subscription) -> StoreResult {
        let Ok(payload) = serde_json::to_string(subscription) else {
            return StoreResult::InternalError;
        };
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(_) => return StoreResult::OperationError,
        };

        let key = self.subscriber_key(subscriber);
        let exists: Result<bool, _> = conn.hexists(&key, &subscription.id.0).await;
        match exists {
            Ok(true) => {}
            Ok(false) => return StoreResult::NotFound,
            Err(e) => return operation_failed("update", e),
        }

        let written: Result<(), _> = conn.hset(&key, &subscription.id.0, payload).await;
        match written {
            Ok(()) => StoreResult::Success,
            Err(e) => operation_failed("update", e),
        }
    }

    async fn delete(&self, subscriber: &SubscriberId, id: &SubscriptionId) -> StoreResult {
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(_) => return StoreResult::OperationError,
        };

        let removed: Result<i64, _> = conn.hdel(self.subscriber_key(subscriber), &id.0).await;
        match removed {
            Ok(0) => StoreResult::NotFound,
            Ok(_) => StoreResult::Success,
            Err(e) => operation_failed("delete", e),
        }
    }

    async fn delete_all(&self, subscriber: &SubscriberId) -> StoreResult {
        let mut conn = match self.connection().await {
            Ok(c) => c,
            Err(_) => return StoreResult::OperationError,
        };

        let removed: Result<i64, _> = conn.del(self.subscriber_key(subscriber)).await;
        match removed {
            Ok(_) => StoreResult::Success,
            Err(e) => operation_failed("delete_all", e),
        }
    }
}
