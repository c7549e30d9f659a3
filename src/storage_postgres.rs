use async_trait::async_trait;
use tokio_postgres::{Client, Row};

use crate::error::{StoreError, StoreResult};
use crate::storage::{is_candidate, SubscriptionPredicate, SubscriptionStore};
use crate::types::{SubscriberId, Subscription, SubscriptionId};

/// Postgres-backed store keyed by `(subscriber_id, id)`.
pub struct PostgresSubscriptionStore {
    client: Client,
}

impl PostgresSubscriptionStore {
    /// Wrap a connected client, creating the table if needed.
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                    subscriber_id TEXT NOT NULL,
                    id TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    PRIMARY KEY (subscriber_id, id)
                )",
                &[],
            )
            .await?;

        Ok(Self { client })
    }

    async fn load(&self, subscriber: &SubscriberId) -> Result<Vec<Subscription>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM webhook_subscriptions WHERE subscriber_id = $1",
                &[&subscriber.0],
            )
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;
        Ok(rows.iter().filter_map(decode).collect())
    }
}

fn decode(row: &Row) -> Option<Subscription> {
    let payload = row
        .try_get::<_, serde_json::Value>("payload")
        .map_err(|e| e.to_string())
        .and_then(|v| serde_json::from_value::<Subscription>(v).map_err(|e| e.to_string()));

    match payload {
        Ok(subscription) => Some(subscription),
        Err(error) => {
            tracing::warn!(
                target: "webhook_dispatch",
                error = %error,
                "Skipping undecodable subscription row"
            );
            None
        }
    }
}

/// Map a rows-affected count to a store result; zero rows yields `none`.
fn affected(
    operation: &'static str,
    result: Result<u64, tokio_postgres::Error>,
    none: StoreResult,
) -> StoreResult {
    match result {
        Ok(0) => none,
        Ok(_) => StoreResult::Success,
        Err(e) => {
            tracing::error!(
                target: "webhook_dispatch",
                operation,
                error = %e,
                "Postgres subscription store operation failed"
            );
            StoreResult::OperationError
        }
    }
}

#[async_trait]
impl SubscriptionStore for PostgresSubscriptionStore {
    async fn get_all(&self, subscriber: &SubscriberId) -> Result<Vec<Subscription>, StoreError> {
        self.load(subscriber).await
    }

    async fn query(
        &self,
        subscriber: &SubscriberId,
        actions: &[String],
        predicate: SubscriptionPredicate<'_>,
    ) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .load(subscriber)
            .await?
            .into_iter()
            .filter(|s| is_candidate(s, subscriber, actions, predicate))
            .collect())
    }

    async fn query_all(
        &self,
        actions: &[String],
        predicate: SubscriptionPredicate<'_>,
    ) -> Result<Vec<Subscription>, StoreError> {
        let rows = self
            .client
            .query("SELECT subscriber_id, payload FROM webhook_subscriptions", &[])
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let subscriber = SubscriberId(row.try_get::<_, String>("subscriber_id").ok()?);
                let subscription = decode(row)?;
                is_candidate(&subscription, &subscriber, actions, predicate).then_some(subscription)
            })
            .collect())
    }

    async fn lookup(
        &self,
        subscriber: &SubscriberId,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM webhook_subscriptions WHERE subscriber_id = $1 AND id = $2",
                &[&subscriber.0, &id.0],
            )
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;
        Ok(row.as_ref().and_then(decode))
    }

    async fn insert(&self, subscriber: &SubscriberId, subscription: &Subscription) -> StoreResult {
        let Ok(payload) = serde_json::to_value(subscription) else {
            return StoreResult::InternalError;
        };
        let result = self
            .client
            .execute(
                "INSERT INTO webhook_subscriptions (subscriber_id, id, payload)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (subscriber_id, id) DO NOTHING",
                &[&subscriber.0, &subscription.id.0, &payload],
            )
            .await;
        affected("insert", result, StoreResult::Conflict)
    }

    async fn update(&self, subscriber: &SubscriberId, subscription: &Subscription) -> StoreResult {
        let Ok(payload) = serde_json::to_value(subscription) else {
            return StoreResult::InternalError;
        };
        let result = self
            .client
            .execute(
                "UPDATE webhook_subscriptions SET payload = $3
                 WHERE subscriber_id = $1 AND id = $2",
                &[&subscriber.0, &subscription.id.0, &payload],
            )
            .await;
        affected("update", result, StoreResult::NotFound)
    }

    async fn delete(&self, subscriber: &SubscriberId, id: &SubscriptionId) -> StoreResult {
        let result = self
            .client
            .execute(
                "DELETE FROM webhook_subscriptions WHERE subscriber_id = $1 AND id = $2",
                &[&subscriber.0, &id.0],
            )
            .await;
        affected("delete", result, StoreResult::NotFound)
    }

    async fn delete_all(&self, subscriber: &SubscriberId) -> StoreResult {
        let result = self
            .client
            .execute(
                "DELETE FROM webhook_subscriptions WHERE subscriber_id = $1",
                &[&subscriber.0],
            )
            .await;
        affected("delete_all", result, StoreResult::Success)
    }
}
