use std::sync::Arc;

use serde_json::json;
use webhook_notify::{
    DeliveryEngine, Dispatcher, DispatcherConfig, EngineConfig, InMemorySubscriptionStore,
    NoopHooks, Notification, SubscriberId, Subscription, SubscriptionStore,
};

#[tokio::main]
async fn main() {
    let store = Arc::new(InMemorySubscriptionStore::new());
    let engine = Arc::new(
        DeliveryEngine::new(EngineConfig::default(), Arc::new(NoopHooks))
            .expect("engine config is valid"),
    );
    let dispatcher = Dispatcher::new(store.clone(), engine.clone(), DispatcherConfig::default())
        .expect("dispatcher config is valid");

    let subscriber = SubscriberId::from("tenant_a");
    let subscription = Subscription::new(
        "https://example.com/webhook",
        "0123456789abcdef0123456789abcdef",
    )
    .with_filters(["order.created", "order.shipped"])
    .with_header("X-Tenant", "tenant_a");

    store.insert(&subscriber, &subscription).await;

    let matched = dispatcher
        .notify(&subscriber, &[Notification::new("order.created", json!({"id": 123}))])
        .await
        .unwrap_or_default();
    println!("queued {matched} work item(s)");

    engine.shutdown().await;
}
