//! Signed webhook notifications with tiered retries.
//!
//! A [`Dispatcher`] matches notifications against stored subscriptions and
//! hands one [`WorkItem`] per matching subscription to a [`WorkItemSink`].
//! The in-process sink is the [`DeliveryEngine`], which POSTs each item to
//! its callback URI with an HMAC-SHA256 signature and retries failures on a
//! fixed schedule. A [`QueueSink`] plus [`RedeliveryLoop`] moves delivery
//! behind a durable queue so work survives restarts.
//!
//! ## Guarantees
//! - Bounded concurrency per retry tier
//! - Fresh deliveries are never starved by retries
//! - Exactly one terminal hook per work item (`on_success`, `on_gone` or `on_failure`)
//! - At-least-once delivery when paired with a durable queue
//!
//! ## Non-Guarantees
//! - Ordering across subscriptions or tiers
//! - Exactly-once delivery
//! - Delivery of backlogged items after shutdown

mod dispatcher;
mod engine;
mod error;
mod hooks;
mod queue;
mod redelivery;
mod signing;
mod storage;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod queue_redis;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use dispatcher::{
    ClientSuppliedIds, Dispatcher, DispatcherConfig, IdValidator, ServerAssignedIds,
    MAX_SECRET_LEN, MIN_SECRET_LEN,
};
pub use engine::{DeliveryEngine, EngineConfig, WorkItemSink};
pub use error::{
    BuildError, DispatchError, FailureReason, QueueError, RedeliveryError, RegistrationError,
    StoreError, StoreResult, VerificationError,
};
pub use hooks::{DeliveryHooks, NoopHooks};
pub use queue::{DurableQueue, InMemoryQueue, QueueMessage, QueueSink, DEFAULT_MAX_DEQUEUE_COUNT};
pub use redelivery::{QueueAckHooks, RedeliveryConfig, RedeliveryLoop};
pub use signing::{
    compute_signature, constant_time_eq, find_signature_header, parse_signature_header, sign,
    verify_signature, SIGNATURE_PREFIX,
};
pub use storage::{InMemorySubscriptionStore, SubscriptionPredicate, SubscriptionStore};
pub use types::{
    matches, matches_any, AckHandle, Notification, SubscriberId, Subscription, SubscriptionId,
    WorkItem, WorkItemId, WILDCARD_FILTER,
};
pub use worker::{ATTEMPT_HEADER, DEFAULT_SIGNATURE_HEADER, ID_HEADER, NOTIFICATION_HEADER};

#[cfg(feature = "redis")]
pub use queue_redis::RedisQueue;

#[cfg(feature = "redis")]
pub use storage_redis::RedisSubscriptionStore;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresSubscriptionStore;
