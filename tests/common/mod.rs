#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use webhook_notify::{DeliveryHooks, DispatchError, FailureReason, Subscription, WorkItem, WorkItemSink};

pub const SECRET: &str = "0123456789abcdef0123456789abcdef";

pub fn subscription(uri: impl Into<String>) -> Subscription {
    Subscription::new(uri, SECRET)
}

/// Counts every hook invocation and keeps the attempt counter of each outcome.
#[derive(Default)]
pub struct RecordingHooks {
    pub success: AtomicUsize,
    pub gone: AtomicUsize,
    pub retry: AtomicUsize,
    pub failure: AtomicUsize,
    pub success_attempts: Mutex<Vec<u32>>,
    pub retry_attempts: Mutex<Vec<u32>>,
    pub failure_reasons: Mutex<Vec<FailureReason>>,
}

impl RecordingHooks {
    pub fn successes(&self) -> usize {
        self.success.load(Ordering::SeqCst)
    }

    pub fn gones(&self) -> usize {
        self.gone.load(Ordering::SeqCst)
    }

    pub fn retries(&self) -> usize {
        self.retry.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failure.load(Ordering::SeqCst)
    }

    pub fn terminal(&self) -> usize {
        self.successes() + self.gones() + self.failures()
    }
}

#[async_trait]
impl DeliveryHooks for RecordingHooks {
    async fn on_success(&self, item: &WorkItem) {
        self.success_attempts.lock().unwrap().push(item.attempt);
        self.success.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_gone(&self, _item: &WorkItem) {
        self.gone.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_retry(&self, item: &WorkItem, _reason: &FailureReason) {
        self.retry_attempts.lock().unwrap().push(item.attempt);
        self.retry.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_failure(&self, _item: &WorkItem, reason: &FailureReason) {
        self.failure_reasons.lock().unwrap().push(reason.clone());
        self.failure.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sink that keeps submitted items instead of delivering them.
#[derive(Default)]
pub struct RecordingSink {
    pub items: Mutex<Vec<WorkItem>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<WorkItem> {
        std::mem::take(&mut *self.items.lock().unwrap())
    }
}

#[async_trait]
impl WorkItemSink for RecordingSink {
    async fn submit(&self, items: Vec<WorkItem>) -> Result<(), DispatchError> {
        self.items.lock().unwrap().extend(items);
        Ok(())
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(10)).await;
    }
}
