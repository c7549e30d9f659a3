use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderName;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BuildError, DispatchError};
use crate::hooks::DeliveryHooks;
use crate::telemetry::metric_inc;
use crate::types::WorkItem;
use crate::worker::{tier_worker, ScheduledItem, WorkerContext, DEFAULT_SIGNATURE_HEADER};

/// Destination for freshly built work items.
///
/// Implemented by [`DeliveryEngine`] for in-process delivery and by
/// [`QueueSink`](crate::QueueSink) when delivery runs in another process.
#[async_trait]
pub trait WorkItemSink: Send + Sync {
    async fn submit(&self, items: Vec<WorkItem>) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay before each retry tier. Empty means the first failure is final.
    pub retry_delays_ms: Vec<u64>,

    /// Concurrent deliveries per tier.
    pub max_concurrent_per_tier: usize,

    /// Upper bound on a single HTTP attempt.
    pub request_timeout_ms: u64,

    pub signature_header: String,

    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_delays_ms: vec![60_000, 240_000],
            max_concurrent_per_tier: 8,
            request_timeout_ms: 30_000,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            user_agent: concat!("webhook-notify/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_retry_delays(mut self, delays: impl IntoIterator<Item = Duration>) -> Self {
        self.retry_delays_ms = delays.into_iter().map(|d| d.as_millis() as u64).collect();
        self
    }

    pub fn with_max_concurrent_per_tier(mut self, max: usize) -> Self {
        self.max_concurrent_per_tier = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_signature_header(mut self, header: impl Into<String>) -> Self {
        self.signature_header = header.into();
        self
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms.iter().copied().map(Duration::from_millis).collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Tiered, concurrency-bounded webhook delivery.
///
/// Tier 0 handles first attempts; tier `k` handles the `k`-th retry after
/// `retry_delays[k - 1]`. Every tier has its own worker pool and backlog, so a
/// backed-up retry tier never starves fresh deliveries.
pub struct DeliveryEngine {
    ctx: Arc<WorkerContext>,
    is_running: AtomicBool,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DeliveryEngine {
    /// Build an engine with its own HTTP client. Must run inside a tokio runtime.
    pub fn new(config: EngineConfig, hooks: Arc<dyn DeliveryHooks>) -> Result<Self, BuildError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| BuildError::Client(e.to_string()))?;

        Self::with_client(config, hooks, http_client)
    }

    /// Build an engine around an existing HTTP client.
    ///
    /// The per-attempt timeout from `config` is applied to every request.
    pub fn with_client(
        config: EngineConfig,
        hooks: Arc<dyn DeliveryHooks>,
        http_client: reqwest::Client,
    ) -> Result<Self, BuildError> {
        let signature_header = HeaderName::from_bytes(config.signature_header.as_bytes())
            .map_err(|_| BuildError::HeaderName(config.signature_header.clone()))?;

        let retry_delays = config.retry_delays();
        let tier_count = retry_delays.len() + 1;
        let workers_per_tier = config.max_concurrent_per_tier.max(1);

        let mut senders = Vec::with_capacity(tier_count);
        let mut receivers = Vec::with_capacity(tier_count);
        for _ in 0..tier_count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(Arc::new(Mutex::new(rx)));
        }

        let ctx = Arc::new(WorkerContext {
            tiers: senders,
            retry_delays,
            request_timeout: config.request_timeout(),
            signature_header,
            hooks,
            cancel: CancellationToken::new(),
            http_client,
        });

        let mut worker_handles = Vec::with_capacity(tier_count * workers_per_tier);
        for (tier, rx) in receivers.into_iter().enumerate() {
            for _ in 0..workers_per_tier {
                worker_handles.push(tokio::spawn(tier_worker(tier, rx.clone(), ctx.clone())));
            }
        }

        tracing::debug!(
            target: "webhook_delivery",
            tier_count,
            workers_per_tier,
            "Delivery engine started"
        );

        Ok(Self {
            ctx,
            is_running: AtomicBool::new(true),
            worker_handles: Mutex::new(worker_handles),
        })
    }

    /// Number of tiers, i.e. retry delays plus the first attempt.
    pub fn tier_count(&self) -> usize {
        self.ctx.tiers.len()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop accepting work, cancel in-flight attempts and wait for every
    /// tier's workers to exit. Backlogged items are dropped.
    pub async fn shutdown(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.ctx.cancel.cancel();

        let handles = std::mem::take(&mut *self.worker_handles.lock().await);
        for handle in handles {
            let _ = handle.await;
        }

        tracing::debug!(target: "webhook_delivery", "Delivery engine stopped");
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        // Workers exit on cancellation, releasing the shared HTTP client.
        self.ctx.cancel.cancel();
    }
}

#[async_trait]
impl WorkItemSink for DeliveryEngine {
    /// Queue items on the tier matching their attempt counter.
    ///
    /// Fresh items start on tier 0. Items rehydrated from a durable queue keep
    /// their progress and never exceed the last tier.
    async fn submit(&self, items: Vec<WorkItem>) -> Result<(), DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Shutdown);
        }

        let last_tier = self.ctx.tiers.len() - 1;
        for item in items {
            let tier = (item.attempt as usize).min(last_tier);
            self.ctx.tiers[tier]
                .send(ScheduledItem::now(item))
                .map_err(|_| DispatchError::Shutdown)?;
            metric_inc("webhook.engine.submitted");
        }
        Ok(())
    }
}
