use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Filter that matches every action.
pub const WILDCARD_FILTER: &str = "*";

/// A subscriber's registration for signed callbacks.
///
/// A `Subscription` describes *where* notifications go, *which* actions
/// the subscriber cares about, and the secret used to sign each callback.
/// Work items carry an owned snapshot, so editing a stored subscription
/// never affects deliveries that are already in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Identifier, unique per subscriber.
    pub id: SubscriptionId,

    /// Target URL for callbacks. Must use `http` or `https`.
    pub callback_uri: String,

    /// Signing secret, 32 to 64 characters.
    pub secret: String,

    /// Suppresses delivery without deleting the registration.
    #[serde(default)]
    pub is_paused: bool,

    /// Action names this subscription wants. `"*"` matches everything.
    #[serde(default)]
    pub filters: BTreeSet<String>,

    /// Extra request headers sent with every callback.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Opaque data merged into every notification body.
    #[serde(default)]
    pub properties: Map<String, Value>,

    /// Free-form description shown to the subscriber.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Subscription {
    /// Create a subscription matching every action.
    pub fn new(callback_uri: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: SubscriptionId::generate(),
            callback_uri: callback_uri.into(),
            secret: secret.into(),
            is_paused: false,
            filters: BTreeSet::from([WILDCARD_FILTER.to_string()]),
            headers: BTreeMap::new(),
            properties: Map::new(),
            description: None,
        }
    }

    /// Use a caller-chosen identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = SubscriptionId(id.into());
        self
    }

    /// Replace the filter set. An empty set falls back to the wildcard.
    pub fn with_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters = filters.into_iter().map(Into::into).collect();
        self.normalize();
        self
    }

    /// Add a header sent with every callback.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a property merged into every notification body.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Pause or resume delivery.
    pub fn paused(mut self, is_paused: bool) -> Self {
        self.is_paused = is_paused;
        self
    }

    /// Copy with the signing secret cleared, for handing back to callers.
    pub fn redacted(&self) -> Self {
        Self {
            secret: String::new(),
            ..self.clone()
        }
    }

    /// Trim, lower-case and de-duplicate filters; an empty set becomes `{"*"}`.
    pub fn normalize(&mut self) {
        let filters: BTreeSet<String> = self
            .filters
            .iter()
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty())
            .collect();

        self.filters = if filters.is_empty() {
            BTreeSet::from([WILDCARD_FILTER.to_string()])
        } else {
            filters
        };
    }

    /// Whether this subscription wants `action`.
    pub fn matches(&self, action: &str) -> bool {
        let action = action.to_lowercase();
        self.filters
            .iter()
            .any(|f| f == WILDCARD_FILTER || f.to_lowercase() == action)
    }

    /// Whether this subscription wants at least one of `actions`.
    pub fn matches_any<I, S>(&self, actions: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        actions.into_iter().any(|a| self.matches(a.as_ref()))
    }
}

/// Free-function form of [`Subscription::matches`].
pub fn matches(subscription: &Subscription, action: &str) -> bool {
    subscription.matches(action)
}

/// Free-function form of [`Subscription::matches_any`].
pub fn matches_any<I, S>(subscription: &Subscription, actions: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    subscription.matches_any(actions)
}

/// One emitted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub action: String,

    #[serde(default)]
    pub payload: Value,
}

impl Notification {
    pub fn new(action: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            action: action.into(),
            payload: payload.into(),
        }
    }
}

/// One subscription's pending delivery of one or more notifications.
///
/// Created once per matching subscription per dispatch. The delivery
/// engine advances `attempt` as the item moves through retry tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Correlation id, stable across retries.
    pub id: WorkItemId,

    /// Snapshot of the subscription at dispatch time.
    pub subscription: Subscription,

    /// Notifications applicable to this subscription.
    pub notifications: Vec<Notification>,

    /// Zero-based attempt counter.
    #[serde(default)]
    pub attempt: u32,

    /// Queue message to acknowledge once delivery completes.
    #[serde(skip)]
    pub ack_handle: Option<AckHandle>,
}

impl WorkItem {
    pub fn new(subscription: Subscription, notifications: Vec<Notification>) -> Self {
        Self {
            id: WorkItemId::generate(),
            subscription,
            notifications,
            attempt: 0,
            ack_handle: None,
        }
    }

    /// Action of the first notification, sent in the notification header.
    pub fn primary_action(&self) -> Option<&str> {
        self.notifications.first().map(|n| n.action.as_str())
    }
}

/// Handle used to acknowledge a durable queue message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckHandle {
    pub message_id: String,

    /// Proof of the current claim; a stale receipt cannot delete the message.
    pub receipt: String,
}

/// Identifier of the principal owning subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(pub String);

/// Identifier of a subscription, unique per subscriber.
///
/// Strongly typed to avoid mixing it up with subscriber ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

/// Correlation id of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemId(pub String);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl WorkItemId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

macro_rules! string_id {
    ($($name:ident),*) => {$(
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    )*};
}

string_id!(SubscriberId, SubscriptionId, WorkItemId);

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(filters: &[&str]) -> Subscription {
        Subscription::new("https://example.test/hook", "a".repeat(32)).with_filters(filters.to_vec())
    }

    #[test]
    fn wildcard_matches_every_action() {
        let sub = subscription(&["*"]);
        assert!(sub.matches("order.created"));
        assert!(sub.matches(""));
        assert!(matches(&sub, "anything.at.all"));
    }

    #[test]
    fn action_match_ignores_case() {
        let sub = subscription(&["Order.Created"]);
        assert!(sub.matches("order.created"));
        assert!(sub.matches("ORDER.CREATED"));
        assert!(!sub.matches("order.shipped"));
    }

    #[test]
    fn no_partial_or_glob_matching() {
        let sub = subscription(&["order.*"]);
        assert!(!sub.matches("order.created"));
        assert!(sub.matches("order.*"));

        let sub = subscription(&["order"]);
        assert!(!sub.matches("order.created"));
    }

    #[test]
    fn matches_any_requires_one_hit() {
        let sub = subscription(&["order.shipped"]);
        assert!(sub.matches_any(["order.created", "order.shipped"]));
        assert!(!matches_any(&sub, ["order.created", "order.cancelled"]));
        assert!(!sub.matches_any(Vec::<String>::new()));
    }

    #[test]
    fn normalize_defaults_to_wildcard() {
        let sub = subscription(&[]);
        assert_eq!(sub.filters, BTreeSet::from(["*".to_string()]));

        let sub = subscription(&["  ", ""]);
        assert_eq!(sub.filters, BTreeSet::from(["*".to_string()]));
    }

    #[test]
    fn normalize_collapses_case_duplicates() {
        let sub = subscription(&["Order.Created", "order.created ", "ORDER.CREATED"]);
        assert_eq!(sub.filters.len(), 1);
        assert!(sub.filters.contains("order.created"));
    }

    #[test]
    fn work_item_serialization_skips_ack_handle() {
        let mut item = WorkItem::new(
            subscription(&["*"]),
            vec![Notification::new("order.created", serde_json::json!({"id": 1}))],
        );
        item.ack_handle = Some(AckHandle {
            message_id: "m1".into(),
            receipt: "r1".into(),
        });

        let json = serde_json::to_string(&item).unwrap();
        assert!(!json.contains("ack_handle"));

        let decoded: WorkItem = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.id, item.id);
        assert!(decoded.ack_handle.is_none());
        assert_eq!(decoded.primary_action(), Some("order.created"));
    }
}
