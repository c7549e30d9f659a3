use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use webhook_notify::{
    DeliveryEngine, EngineConfig, InMemoryQueue, NoopHooks, QueueAckHooks, RedeliveryConfig,
    RedeliveryLoop,
};

/// Delivery worker fed from a durable queue. Swap `InMemoryQueue` for
/// `RedisQueue` (feature `redis`) to share the queue with producer processes.
#[tokio::main]
async fn main() {
    let queue = Arc::new(InMemoryQueue::default());
    let hooks = Arc::new(QueueAckHooks::new(queue.clone(), Arc::new(NoopHooks)));
    let engine = Arc::new(
        DeliveryEngine::new(EngineConfig::default(), hooks).expect("engine config is valid"),
    );

    let redelivery = RedeliveryLoop::new(queue, engine.clone(), RedeliveryConfig::default());
    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        }
    });

    if let Err(e) = redelivery.start(cancel).await {
        eprintln!("redelivery loop failed: {e}");
    }
    engine.shutdown().await;
}
