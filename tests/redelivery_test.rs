mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{subscription, wait_until, RecordingHooks, RecordingSink};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use webhook_notify::{
    AckHandle, DeliveryEngine, Dispatcher, DispatcherConfig, DurableQueue, EngineConfig,
    InMemoryQueue, InMemorySubscriptionStore, Notification, QueueAckHooks, QueueError,
    QueueMessage, QueueSink, RedeliveryConfig, RedeliveryError, RedeliveryLoop, SubscriberId,
    SubscriptionStore, WorkItem,
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn redelivery_config() -> RedeliveryConfig {
    RedeliveryConfig {
        max_messages: 8,
        visibility_timeout_ms: 60_000,
        polling_interval_ms: 20,
    }
}

struct Pipeline {
    queue: Arc<InMemoryQueue>,
    hooks: Arc<RecordingHooks>,
    engine: Arc<DeliveryEngine>,
    redelivery: Arc<RedeliveryLoop>,
}

fn pipeline(retry_delays_ms: &[u64]) -> Pipeline {
    let queue = Arc::new(InMemoryQueue::default());
    let hooks = Arc::new(RecordingHooks::default());
    let engine = Arc::new(
        DeliveryEngine::new(
            EngineConfig::default()
                .with_retry_delays(retry_delays_ms.iter().copied().map(Duration::from_millis)),
            Arc::new(QueueAckHooks::new(queue.clone(), hooks.clone())),
        )
        .unwrap(),
    );
    let redelivery = Arc::new(RedeliveryLoop::new(
        queue.clone(),
        engine.clone(),
        redelivery_config(),
    ));
    Pipeline {
        queue,
        hooks,
        engine,
        redelivery,
    }
}

async fn wait_for_empty(queue: &InMemoryQueue) {
    for _ in 0..500 {
        if queue.is_empty().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue was not drained");
}

#[tokio::test]
async fn queued_notifications_are_delivered_and_acknowledged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let p = pipeline(&[10]);

    let store = Arc::new(InMemorySubscriptionStore::new());
    let subscriber = SubscriberId::from("user1");
    store
        .insert(&subscriber, &subscription(format!("{}/hook", server.uri())))
        .await;
    let dispatcher = Dispatcher::new(
        store,
        Arc::new(QueueSink::new(p.queue.clone())),
        DispatcherConfig::default(),
    )
    .unwrap();

    let matched = dispatcher
        .notify(&subscriber, &[Notification::new("order.created", json!({"id": 7}))])
        .await
        .unwrap();
    assert_eq!(matched, 1);
    assert_eq!(p.queue.len().await, 1);

    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let redelivery = p.redelivery.clone();
        let cancel = cancel.clone();
        async move { redelivery.start(cancel).await }
    });

    wait_until(|| p.hooks.successes() == 1).await;
    wait_for_empty(&p.queue).await;

    assert_eq!(
        p.redelivery.start(cancel.clone()).await,
        Err(RedeliveryError::AlreadyStarted)
    );

    cancel.cancel();
    assert_eq!(running.await.unwrap(), Ok(()));
    p.engine.shutdown().await;
}

#[tokio::test]
async fn abandoned_items_stay_queued() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let p = pipeline(&[]);
    let item = WorkItem::new(
        subscription(format!("{}/hook", server.uri())),
        vec![Notification::new("ping", json!(null))],
    );
    p.queue
        .add_messages(vec![serde_json::to_string(&item).unwrap()])
        .await
        .unwrap();

    assert_eq!(p.redelivery.poll_once().await.unwrap(), 1);
    wait_until(|| p.hooks.failures() == 1).await;

    assert_eq!(p.queue.len().await, 1);
    assert!(p.queue.get_messages(8, Duration::from_secs(1)).await.unwrap().is_empty());
    p.engine.shutdown().await;
}

#[tokio::test]
async fn rehydrated_items_keep_their_attempt_counter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let p = pipeline(&[10, 10]);
    let mut item = WorkItem::new(
        subscription(format!("{}/hook", server.uri())),
        vec![Notification::new("ping", json!(null))],
    );
    item.attempt = 2;
    p.queue
        .add_messages(vec![serde_json::to_string(&item).unwrap()])
        .await
        .unwrap();

    p.redelivery.poll_once().await.unwrap();
    wait_until(|| p.hooks.successes() == 1).await;

    assert_eq!(*p.hooks.success_attempts.lock().unwrap(), vec![2]);
    let request = server.received_requests().await.unwrap().remove(0);
    assert_eq!(request.headers.get("x-webhook-attempt").unwrap(), "3");
    p.engine.shutdown().await;
}

#[tokio::test]
async fn undecodable_messages_are_skipped() {
    let queue = Arc::new(InMemoryQueue::default());
    let sink = Arc::new(RecordingSink::default());
    let redelivery = RedeliveryLoop::new(queue.clone(), sink.clone(), redelivery_config());

    queue.add_messages(vec!["{not json".to_string()]).await.unwrap();

    assert_eq!(redelivery.poll_once().await.unwrap(), 1);
    assert!(sink.take().is_empty());
}

/// Queue whose first `get_messages` call fails with a backend error.
#[derive(Default)]
struct FailingOnceQueue {
    inner: InMemoryQueue,
    polls: AtomicUsize,
}

#[async_trait]
impl DurableQueue for FailingOnceQueue {
    async fn add_messages(&self, bodies: Vec<String>) -> Result<(), QueueError> {
        self.inner.add_messages(bodies).await
    }

    async fn get_messages(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        if self.polls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(QueueError::Backend("connection reset".into()));
        }
        self.inner.get_messages(max, visibility_timeout).await
    }

    async fn delete_message(&self, handle: &AckHandle) -> Result<bool, QueueError> {
        self.inner.delete_message(handle).await
    }
}

#[tokio::test]
async fn failed_iteration_is_retried_after_polling_interval() {
    let queue = Arc::new(FailingOnceQueue::default());
    let sink = Arc::new(RecordingSink::default());
    let redelivery = Arc::new(RedeliveryLoop::new(
        queue.clone(),
        sink.clone(),
        redelivery_config(),
    ));

    let item = WorkItem::new(
        subscription("https://example.test/hook"),
        vec![Notification::new("ping", json!(null))],
    );
    queue
        .add_messages(vec![serde_json::to_string(&item).unwrap()])
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let redelivery = redelivery.clone();
        let cancel = cancel.clone();
        async move { redelivery.start(cancel).await }
    });

    let mut delivered = Vec::new();
    for _ in 0..500 {
        delivered.extend(sink.take());
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, item.id);
    assert!(delivered[0].ack_handle.is_some());
    assert!(queue.polls.load(Ordering::SeqCst) >= 2);

    cancel.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("loop stops after cancel");
    assert_eq!(stopped.unwrap(), Ok(()));
}

#[tokio::test]
async fn cancel_interrupts_polling_sleep() {
    let queue = Arc::new(InMemoryQueue::default());
    let redelivery = Arc::new(RedeliveryLoop::new(
        queue,
        Arc::new(RecordingSink::default()),
        RedeliveryConfig {
            polling_interval_ms: 60_000,
            ..redelivery_config()
        },
    ));

    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let redelivery = redelivery.clone();
        let cancel = cancel.clone();
        async move { redelivery.start(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let stopped = tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("loop stops while sleeping");
    assert_eq!(stopped.unwrap(), Ok(()));
}
