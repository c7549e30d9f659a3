use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::WorkItemSink;
use crate::error::{BuildError, DispatchError, RegistrationError, StoreResult, VerificationError};
use crate::storage::{SubscriptionPredicate, SubscriptionStore};
use crate::telemetry::metric_inc;
use crate::types::{Notification, SubscriberId, Subscription, SubscriptionId, WorkItem};

/// Shortest accepted signing secret, in characters.
pub const MIN_SECRET_LEN: usize = 32;

/// Longest accepted signing secret, in characters.
pub const MAX_SECRET_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on the registration echo request.
    pub echo_timeout_ms: u64,

    /// Query parameter carrying the echo challenge.
    pub echo_parameter: String,

    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            echo_timeout_ms: 10_000,
            echo_parameter: "echo".to_string(),
            user_agent: concat!("webhook-notify/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }
}

/// Decides the id of a subscription being registered.
pub trait IdValidator: Send + Sync {
    fn resolve(&self, requested: &SubscriptionId) -> Result<SubscriptionId, RegistrationError>;
}

/// Always assigns a fresh server-side id, ignoring the requested one.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerAssignedIds;

impl IdValidator for ServerAssignedIds {
    fn resolve(&self, _requested: &SubscriptionId) -> Result<SubscriptionId, RegistrationError> {
        Ok(SubscriptionId::generate())
    }
}

/// Accepts client-supplied ids made of ASCII letters, digits, `-` and `_`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientSuppliedIds;

impl IdValidator for ClientSuppliedIds {
    fn resolve(&self, requested: &SubscriptionId) -> Result<SubscriptionId, RegistrationError> {
        let id = requested.0.trim();
        let valid = !id.is_empty()
            && id.len() <= 64
            && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(SubscriptionId(id.to_string()))
        } else {
            Err(RegistrationError::InvalidId(requested.0.clone()))
        }
    }
}

/// Matches notifications against stored subscriptions and hands the
/// resulting work items to a sink.
///
/// Also owns the registration-time echo check.
pub struct Dispatcher {
    store: Arc<dyn SubscriptionStore>,
    sink: Arc<dyn WorkItemSink>,
    id_validator: Arc<dyn IdValidator>,
    http_client: reqwest::Client,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        sink: Arc<dyn WorkItemSink>,
        config: DispatcherConfig,
    ) -> Result<Self, BuildError> {
        let http_client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| BuildError::Client(e.to_string()))?;

        Ok(Self::with_client(store, sink, http_client, config))
    }

    pub fn with_client(
        store: Arc<dyn SubscriptionStore>,
        sink: Arc<dyn WorkItemSink>,
        http_client: reqwest::Client,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            sink,
            id_validator: Arc::new(ServerAssignedIds),
            http_client,
            config,
        }
    }

    pub fn with_id_validator(mut self, validator: Arc<dyn IdValidator>) -> Self {
        self.id_validator = validator;
        self
    }

    /// Check that a subscription can receive callbacks.
    ///
    /// Validates the secret length and URI scheme, then sends
    /// `GET <callback_uri>?echo=<token>` and requires a 2xx response whose
    /// body is exactly `<token>`.
    pub async fn verify_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<(), VerificationError> {
        let secret_len = subscription.secret.chars().count();
        if !(MIN_SECRET_LEN..=MAX_SECRET_LEN).contains(&secret_len) {
            return Err(VerificationError::SecretLength { actual: secret_len });
        }

        let mut url = Url::parse(&subscription.callback_uri)
            .map_err(|e| VerificationError::InvalidUri(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(VerificationError::UnsupportedScheme(url.scheme().to_string()));
        }

        let token = Uuid::new_v4().simple().to_string();
        url.query_pairs_mut()
            .append_pair(&self.config.echo_parameter, &token);

        let response = self
            .http_client
            .get(url)
            .timeout(self.config.echo_timeout())
            .send()
            .await
            .map_err(|e| VerificationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VerificationError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| VerificationError::Transport(e.to_string()))?;
        if body.is_empty() {
            return Err(VerificationError::EmptyBody);
        }
        if body != token {
            return Err(VerificationError::EchoMismatch);
        }

        tracing::debug!(
            target: "webhook_dispatch",
            subscription_id = %subscription.id,
            "Echo verification succeeded"
        );
        Ok(())
    }

    /// Create a subscription after it passes verification.
    ///
    /// The id comes from the configured [`IdValidator`]; filters are normalized.
    pub async fn register(
        &self,
        subscriber: &SubscriberId,
        mut subscription: Subscription,
    ) -> Result<Subscription, RegistrationError> {
        subscription.id = self.id_validator.resolve(&subscription.id)?;
        subscription.normalize();
        self.verify_subscription(&subscription).await?;

        match self.store.insert(subscriber, &subscription).await {
            StoreResult::Success => {
                tracing::info!(
                    target: "webhook_dispatch",
                    subscriber = %subscriber,
                    subscription_id = %subscription.id,
                    "Subscription registered"
                );
                Ok(subscription)
            }
            other => Err(RegistrationError::Store(other)),
        }
    }

    /// Replace an existing subscription wholesale after it passes verification.
    ///
    /// The returned copy has its secret cleared; only registration echoes it back.
    pub async fn replace(
        &self,
        subscriber: &SubscriberId,
        mut subscription: Subscription,
    ) -> Result<Subscription, RegistrationError> {
        subscription.normalize();
        self.verify_subscription(&subscription).await?;

        match self.store.update(subscriber, &subscription).await {
            StoreResult::Success => Ok(subscription.redacted()),
            other => Err(RegistrationError::Store(other)),
        }
    }

    /// Notify one subscriber's matching subscriptions.
    ///
    /// Returns the number of work items submitted; delivery happens later.
    pub async fn notify(
        &self,
        subscriber: &SubscriberId,
        notifications: &[Notification],
    ) -> Result<usize, DispatchError> {
        self.notify_filtered(subscriber, notifications, &accept_all).await
    }

    /// Like [`notify`](Self::notify), keeping only subscriptions accepted by `predicate`.
    pub async fn notify_filtered(
        &self,
        subscriber: &SubscriberId,
        notifications: &[Notification],
        predicate: SubscriptionPredicate<'_>,
    ) -> Result<usize, DispatchError> {
        if notifications.is_empty() {
            return Ok(0);
        }

        let actions = actions_of(notifications);
        let subscriptions = self.store.query(subscriber, &actions, predicate).await?;
        let items = build_work_items(subscriptions, notifications);

        tracing::debug!(
            target: "webhook_dispatch",
            subscriber = %subscriber,
            notification_count = notifications.len(),
            matched = items.len(),
            "Notifying subscriber"
        );

        self.submit(items).await
    }

    /// Notify matching subscriptions of every subscriber.
    pub async fn notify_all(&self, notifications: &[Notification]) -> Result<usize, DispatchError> {
        self.notify_all_filtered(notifications, &accept_all).await
    }

    /// Like [`notify_all`](Self::notify_all), keeping only subscriptions accepted by `predicate`.
    pub async fn notify_all_filtered(
        &self,
        notifications: &[Notification],
        predicate: SubscriptionPredicate<'_>,
    ) -> Result<usize, DispatchError> {
        if notifications.is_empty() {
            return Ok(0);
        }

        let actions = actions_of(notifications);
        let subscriptions = self.store.query_all(&actions, predicate).await?;
        let items = build_work_items(subscriptions, notifications);

        tracing::debug!(
            target: "webhook_dispatch",
            notification_count = notifications.len(),
            matched = items.len(),
            "Notifying all subscribers"
        );

        self.submit(items).await
    }

    async fn submit(&self, items: Vec<WorkItem>) -> Result<usize, DispatchError> {
        let count = items.len();
        if count == 0 {
            return Ok(0);
        }

        self.sink.submit(items).await?;
        metric_inc("webhook.dispatch.submitted");
        Ok(count)
    }
}

fn accept_all(_: &Subscription, _: &SubscriberId) -> bool {
    true
}

fn actions_of(notifications: &[Notification]) -> Vec<String> {
    let mut actions: Vec<String> = notifications.iter().map(|n| n.action.clone()).collect();
    actions.sort();
    actions.dedup();
    actions
}

/// One work item per subscription that has at least one applicable notification.
///
/// A single notification is attached to every candidate without re-checking
/// filters; larger batches are filtered per notification. The asymmetry only
/// shows with a custom store whose `query` is looser than [`Subscription::matches`].
fn build_work_items(subscriptions: Vec<Subscription>, notifications: &[Notification]) -> Vec<WorkItem> {
    subscriptions
        .into_iter()
        .filter_map(|subscription| {
            let applicable: Vec<Notification> = if notifications.len() == 1 {
                notifications.to_vec()
            } else {
                notifications
                    .iter()
                    .filter(|n| subscription.matches(&n.action))
                    .cloned()
                    .collect()
            };

            if applicable.is_empty() {
                None
            } else {
                Some(WorkItem::new(subscription, applicable))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sub(filters: &[&str]) -> Subscription {
        Subscription::new("https://example.test/hook", "s".repeat(32)).with_filters(filters.to_vec())
    }

    #[test]
    fn single_notification_goes_to_every_candidate() {
        let subs = vec![sub(&["order.created"]), sub(&["order.shipped"])];
        let items = build_work_items(subs, &[Notification::new("order.created", json!({}))]);
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.notifications.len() == 1));
    }

    #[test]
    fn batch_is_filtered_per_subscription() {
        let subs = vec![sub(&["order.created"]), sub(&["order.shipped"]), sub(&["user.deleted"])];
        let batch = [
            Notification::new("order.created", json!({"id": 1})),
            Notification::new("order.shipped", json!({"id": 1})),
            Notification::new("order.created", json!({"id": 2})),
        ];

        let items = build_work_items(subs, &batch);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].notifications.len(), 2);
        assert_eq!(items[1].notifications.len(), 1);
        assert_eq!(items[1].notifications[0].action, "order.shipped");
    }

    #[test]
    fn work_items_start_at_attempt_zero_with_unique_ids() {
        let items = build_work_items(
            vec![sub(&["*"]), sub(&["*"])],
            &[Notification::new("a", json!(null))],
        );
        assert!(items.iter().all(|i| i.attempt == 0 && i.ack_handle.is_none()));
        assert_ne!(items[0].id, items[1].id);
    }

    #[test]
    fn actions_are_deduplicated() {
        let batch = [
            Notification::new("b", json!(null)),
            Notification::new("a", json!(null)),
            Notification::new("b", json!(null)),
        ];
        assert_eq!(actions_of(&batch), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn client_supplied_ids_are_checked() {
        let v = ClientSuppliedIds;
        assert_eq!(
            v.resolve(&SubscriptionId::from("orders_hook-1")).unwrap(),
            SubscriptionId::from("orders_hook-1")
        );
        assert!(v.resolve(&SubscriptionId::from("")).is_err());
        assert!(v.resolve(&SubscriptionId::from("has space")).is_err());
        assert!(v.resolve(&SubscriptionId::from("x".repeat(65))).is_err());
    }

    #[test]
    fn server_assigned_ids_ignore_request() {
        let id = ServerAssignedIds.resolve(&SubscriptionId::from("mine")).unwrap();
        assert_ne!(id, SubscriptionId::from("mine"));
        assert_eq!(id.0.len(), 32);
    }
}
