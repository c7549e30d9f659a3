use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::FailureReason;
use crate::hooks::DeliveryHooks;
use crate::signing;
use crate::telemetry::{metric_inc, metric_inc_tier};
use crate::types::{Notification, WorkItem, WorkItemId};

/// Header carrying the work item id.
pub const ID_HEADER: &str = "X-Webhook-Id";

/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// Header carrying the primary action name.
pub const NOTIFICATION_HEADER: &str = "X-Webhook-Notification";

/// Default header carrying the `sha256=<hex>` signature.
pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Webhook-Signature";

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// A work item waiting in a tier backlog.
///
/// Retry tiers have a fixed delay, so backlog order is also `ready_at` order.
#[derive(Debug)]
pub(crate) struct ScheduledItem {
    pub item: WorkItem,
    pub ready_at: Option<Instant>,
}

impl ScheduledItem {
    pub fn now(item: WorkItem) -> Self {
        Self { item, ready_at: None }
    }
}

/// State shared by every tier worker.
pub(crate) struct WorkerContext {
    /// Backlog senders, one per tier.
    pub tiers: Vec<mpsc::UnboundedSender<ScheduledItem>>,

    /// Delay before tier `k + 1` runs, indexed by `k`.
    pub retry_delays: Vec<Duration>,

    /// Upper bound on a single attempt.
    pub request_timeout: Duration,

    pub signature_header: HeaderName,

    pub hooks: Arc<dyn DeliveryHooks>,

    /// Cancels in-flight requests and pending delays.
    pub cancel: CancellationToken,

    pub http_client: reqwest::Client,
}

/// Result of one HTTP attempt.
#[derive(Debug, PartialEq, Eq)]
enum Attempt {
    Delivered,
    Gone,
    Failed(FailureReason),
    Cancelled,
}

/// Main worker loop for one tier.
///
/// Each worker:
/// - Pulls scheduled items from the tier's shared backlog
/// - Waits until the item is due
/// - Performs one attempt and routes the outcome
///
/// A tier runs a fixed number of these, which bounds its concurrent requests.
pub(crate) async fn tier_worker(
    tier: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<ScheduledItem>>>,
    ctx: Arc<WorkerContext>,
) {
    loop {
        let scheduled = {
            let mut guard = tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                guard = rx.lock() => guard,
            };
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                next = guard.recv() => next,
            }
        };

        let Some(scheduled) = scheduled else { break };

        if let Some(ready_at) = scheduled.ready_at {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    tracing::debug!(
                        target: "webhook_delivery",
                        work_item_id = %scheduled.item.id,
                        tier,
                        "Dropping scheduled retry on shutdown"
                    );
                    break;
                }
                _ = sleep_until(ready_at) => {}
            }
        }

        process_item(tier, scheduled.item, &ctx).await;
    }
}

/// Perform one attempt and move the item to its next state.
async fn process_item(tier: usize, item: WorkItem, ctx: &WorkerContext) {
    metric_inc_tier("webhook.delivery.attempt", tier);

    match deliver(&item, ctx).await {
        Attempt::Delivered => {
            tracing::info!(
                target: "webhook_delivery",
                work_item_id = %item.id,
                subscription_id = %item.subscription.id,
                attempt = item.attempt,
                "Webhook delivered"
            );
            metric_inc("webhook.delivery.delivered");
            ctx.hooks.on_success(&item).await;
        }
        Attempt::Gone => {
            tracing::warn!(
                target: "webhook_delivery",
                work_item_id = %item.id,
                subscription_id = %item.subscription.id,
                callback_uri = %item.subscription.callback_uri,
                "Subscriber endpoint is gone"
            );
            metric_inc("webhook.delivery.gone");
            ctx.hooks.on_gone(&item).await;
        }
        Attempt::Failed(reason) => retry_or_abandon(item, reason, ctx).await,
        Attempt::Cancelled => {
            tracing::debug!(
                target: "webhook_delivery",
                work_item_id = %item.id,
                tier,
                "Attempt cancelled on shutdown"
            );
        }
    }
}

async fn retry_or_abandon(mut item: WorkItem, reason: FailureReason, ctx: &WorkerContext) {
    item.attempt = item.attempt.saturating_add(1);
    let next_tier = item.attempt as usize;

    let Some(delay) = ctx.retry_delays.get(next_tier - 1).copied() else {
        tracing::error!(
            target: "webhook_delivery",
            work_item_id = %item.id,
            subscription_id = %item.subscription.id,
            attempts = item.attempt,
            error = %reason,
            "Webhook abandoned after final attempt"
        );
        metric_inc("webhook.delivery.abandoned");
        ctx.hooks.on_failure(&item, &reason).await;
        return;
    };

    let ready_at = Instant::now() + delay;

    tracing::warn!(
        target: "webhook_delivery",
        work_item_id = %item.id,
        subscription_id = %item.subscription.id,
        next_tier,
        delay_ms = delay.as_millis() as u64,
        error = %reason,
        "Webhook attempt failed, retry scheduled"
    );
    metric_inc("webhook.delivery.retry_scheduled");
    ctx.hooks.on_retry(&item, &reason).await;

    let Some(tx) = ctx.tiers.get(next_tier) else {
        return;
    };
    if tx.send(ScheduledItem { item, ready_at: Some(ready_at) }).is_err() {
        tracing::debug!(
            target: "webhook_delivery",
            next_tier,
            "Retry tier closed, dropping work item"
        );
    }
}

async fn deliver(item: &WorkItem, ctx: &WorkerContext) -> Attempt {
    let request = match build_request(item, ctx) {
        Ok(request) => request,
        Err(reason) => return Attempt::Failed(reason),
    };

    let response = tokio::select! {
        _ = ctx.cancel.cancelled() => return Attempt::Cancelled,
        response = request.send() => response,
    };

    match response {
        Ok(resp) => classify_status(resp.status().as_u16()),
        Err(err) if err.is_timeout() => Attempt::Failed(FailureReason::Timeout),
        Err(err) => Attempt::Failed(FailureReason::Network(err.to_string())),
    }
}

fn classify_status(status: u16) -> Attempt {
    match status {
        200..=299 => Attempt::Delivered,
        410 => Attempt::Gone,
        other => Attempt::Failed(FailureReason::Status(other)),
    }
}

/// JSON body sent to subscribers.
#[derive(Serialize)]
struct NotificationEnvelope<'a> {
    id: &'a WorkItemId,
    attempt: u32,
    properties: &'a Map<String, Value>,
    notifications: &'a [Notification],
}

pub(crate) fn encode_body(item: &WorkItem) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&NotificationEnvelope {
        id: &item.id,
        attempt: item.attempt.saturating_add(1),
        properties: &item.subscription.properties,
        notifications: &item.notifications,
    })
}

fn build_request(
    item: &WorkItem,
    ctx: &WorkerContext,
) -> Result<reqwest::RequestBuilder, FailureReason> {
    let body = encode_body(item).map_err(|e| FailureReason::Request(e.to_string()))?;
    let signature = signing::sign(&item.subscription.secret, &body);

    let mut request = ctx
        .http_client
        .post(&item.subscription.callback_uri)
        .timeout(ctx.request_timeout)
        .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
        .header(ctx.signature_header.clone(), signature)
        .header(ID_HEADER, item.id.0.as_str())
        .header(ATTEMPT_HEADER, item.attempt.saturating_add(1).to_string());

    if let Some(action) = item.primary_action() {
        let value = HeaderValue::from_str(action)
            .map_err(|e| FailureReason::Request(format!("action header: {e}")))?;
        request = request.header(NOTIFICATION_HEADER, value);
    }

    for (name, value) in &item.subscription.headers {
        if is_reserved_header(name, &ctx.signature_header) {
            tracing::warn!(
                target: "webhook_delivery",
                subscription_id = %item.subscription.id,
                header = %name,
                "Ignoring subscription header that collides with a reserved header"
            );
            continue;
        }

        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            tracing::warn!(
                target: "webhook_delivery",
                subscription_id = %item.subscription.id,
                header = %name,
                "Ignoring invalid subscription header"
            );
            continue;
        };
        request = request.header(name, value);
    }

    Ok(request.body(body))
}

fn is_reserved_header(name: &str, signature_header: &HeaderName) -> bool {
    [
        ID_HEADER,
        ATTEMPT_HEADER,
        NOTIFICATION_HEADER,
        CONTENT_TYPE.as_str(),
        CONTENT_LENGTH.as_str(),
        TRANSFER_ENCODING.as_str(),
        HOST.as_str(),
        CONNECTION.as_str(),
        signature_header.as_str(),
    ]
    .iter()
    .any(|reserved| reserved.eq_ignore_ascii_case(name.trim()))
}
