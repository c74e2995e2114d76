//! Delivery workers: pull delivery ids from the ready queue, perform the
//! signed HTTP POST, and record the outcome.
//!
//! A worker never lets an error escape its loop. Unexpected internal
//! failures mark the delivery failed and are logged; the loop keeps
//! consuming.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::dispatcher::DispatcherConfig;
use crate::error::{FailureKind, WebhookError};
use crate::signing::{payload_bytes, sign, SIGNATURE_HEADER};
use crate::store::{DeliveryStore, ResponseMeta, SubscriptionStore};
use crate::types::{Delivery, DeliveryId, Subscription};

/// Header carrying the event's wire name.
pub const EVENT_HEADER: &str = "X-Webhook-Event";
/// Header carrying the delivery record id.
pub const DELIVERY_ID_HEADER: &str = "X-Webhook-Delivery-ID";
/// Header carrying the event creation time, ISO-8601.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// A retry handed to the in-process scheduler.
#[derive(Debug)]
pub(crate) struct ScheduledRetry {
    pub delivery_id: DeliveryId,
    pub ready_at: tokio::time::Instant,
}

/// Shared state for the worker pool.
pub(crate) struct WorkerContext {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub deliveries: Arc<dyn DeliveryStore>,
    pub http_client: reqwest::Client,
    pub schedule_tx: mpsc::Sender<ScheduledRetry>,
    pub config: DispatcherConfig,
}

/// Consume delivery ids until the ready queue is closed.
///
/// The receiver is shared; whichever worker grabs the lock first takes the
/// next id, then releases the lock before doing any network work.
pub(crate) async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<DeliveryId>>>,
    ctx: Arc<WorkerContext>,
) {
    loop {
        let delivery_id = {
            let mut rx = rx.lock().await;
            match rx.recv().await {
                Some(id) => id,
                None => return,
            }
        };
        attempt(&ctx, delivery_id).await;
    }
}

/// Run one delivery attempt, absorbing internal errors.
pub(crate) async fn attempt(ctx: &WorkerContext, delivery_id: DeliveryId) {
    if let Err(err) = try_attempt(ctx, delivery_id).await {
        error!(
            target: "webhook_delivery",
            delivery_id = %delivery_id,
            error = %err,
            "delivery attempt aborted by internal error"
        );
        // Re-read the count so the failure record does not roll it back;
        // the store's terminal guard keeps this off settled deliveries.
        let attempt_count = match ctx.deliveries.get(delivery_id).await {
            Ok(Some(delivery)) => delivery.attempt_count,
            _ => 0,
        };
        let message = truncate(&format!("internal error: {err}"), ctx.config.error_cap);
        if let Err(err) = ctx
            .deliveries
            .mark_failed(
                delivery_id,
                attempt_count,
                &message,
                ResponseMeta::none(),
                Utc::now(),
            )
            .await
        {
            error!(
                target: "webhook_delivery",
                delivery_id = %delivery_id,
                error = %err,
                "failed to record internal delivery failure"
            );
        }
    }
}

async fn try_attempt(ctx: &WorkerContext, delivery_id: DeliveryId) -> Result<(), WebhookError> {
    let Some(delivery) = ctx.deliveries.get(delivery_id).await? else {
        warn!(
            target: "webhook_delivery",
            delivery_id = %delivery_id,
            "delivery vanished before attempt"
        );
        return Ok(());
    };

    // Duplicate-enqueue guard: a sweeper rescue and a scheduler wake can
    // both enqueue the same id.
    if delivery.status.is_terminal() {
        debug!(
            target: "webhook_delivery",
            delivery_id = %delivery_id,
            status = %delivery.status,
            "skipping already-settled delivery"
        );
        return Ok(());
    }

    let subscription = ctx.subscriptions.get(delivery.subscription_id).await?;
    let subscription = match subscription {
        Some(sub) if sub.active => sub,
        other => {
            // Deactivated or deleted between enqueue and attempt.
            let kind = FailureKind::SubscriptionInactive;
            let applied = ctx
                .deliveries
                .mark_failed(
                    delivery_id,
                    delivery.attempt_count,
                    &kind.to_string(),
                    ResponseMeta::none(),
                    Utc::now(),
                )
                .await?;
            if applied && other.is_some() {
                ctx.subscriptions
                    .record_outcome(delivery.subscription_id, false, Utc::now())
                    .await?;
            }
            return Ok(());
        }
    };

    // Persist `sending` before any network I/O so a crash mid-POST leaves a
    // leased row the sweeper can reclaim. The claim is a conditional write;
    // losing it means another worker owns the attempt or it already settled.
    let lease = Utc::now()
        + chrono::Duration::seconds(subscription.timeout.as_secs() as i64 * 2)
        + chrono::Duration::seconds(1);
    if !ctx.deliveries.mark_sending(delivery_id, lease).await? {
        debug!(
            target: "webhook_delivery",
            delivery_id = %delivery_id,
            "delivery claimed elsewhere, skipping"
        );
        return Ok(());
    }

    let outcome = send(ctx, &delivery, &subscription).await;
    let attempt_count = delivery.attempt_count + 1;
    let now = Utc::now();

    match outcome {
        Ok(response) => {
            debug!(
                target: "webhook_delivery",
                delivery_id = %delivery_id,
                subscription_id = %subscription.id,
                attempt = attempt_count,
                status = response.code,
                latency_ms = response.latency_ms,
                "delivery succeeded"
            );
            let applied = ctx
                .deliveries
                .mark_success(delivery_id, attempt_count, response, now)
                .await?;
            if applied {
                ctx.subscriptions
                    .record_outcome(subscription.id, true, now)
                    .await?;
            }
        }
        Err((kind, response)) => {
            let message = truncate(&kind.to_string(), ctx.config.error_cap);
            if kind.is_retryable() && attempt_count < subscription.max_retries {
                let delay = backoff_delay(
                    subscription.retry_base,
                    attempt_count,
                    ctx.config.max_backoff,
                ) + Duration::from_millis(fastrand::u64(0..=ctx.config.retry_jitter_ms));
                let next_retry_at = now
                    + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64);
                warn!(
                    target: "webhook_delivery",
                    delivery_id = %delivery_id,
                    subscription_id = %subscription.id,
                    attempt = attempt_count,
                    error = %kind,
                    retry_in_ms = delay.as_millis() as u64,
                    "delivery failed, will retry"
                );
                let applied = ctx
                    .deliveries
                    .mark_retrying(delivery_id, attempt_count, next_retry_at, &message, response)
                    .await?;
                if applied {
                    ctx.subscriptions
                        .record_attempt(subscription.id, now)
                        .await?;
                    // The scheduler may already be gone during shutdown; the
                    // persisted next_retry_at lets the sweeper pick it up.
                    if ctx
                        .schedule_tx
                        .send(ScheduledRetry {
                            delivery_id,
                            ready_at: tokio::time::Instant::now() + delay,
                        })
                        .await
                        .is_err()
                    {
                        debug!(
                            target: "webhook_delivery",
                            delivery_id = %delivery_id,
                            "scheduler unavailable, retry left to sweeper"
                        );
                    }
                }
            } else {
                warn!(
                    target: "webhook_delivery",
                    delivery_id = %delivery_id,
                    subscription_id = %subscription.id,
                    attempt = attempt_count,
                    error = %kind,
                    "delivery failed permanently"
                );
                let applied = ctx
                    .deliveries
                    .mark_failed(delivery_id, attempt_count, &message, response, now)
                    .await?;
                if applied {
                    ctx.subscriptions
                        .record_outcome(subscription.id, false, now)
                        .await?;
                }
            }
        }
    }

    Ok(())
}

/// Perform the signed POST and classify the result.
async fn send(
    ctx: &WorkerContext,
    delivery: &Delivery,
    subscription: &Subscription,
) -> Result<ResponseMeta, (FailureKind, ResponseMeta)> {
    let body = payload_bytes(&delivery.payload);
    let signature = sign(&subscription.secret, &body);

    let started = tokio::time::Instant::now();
    let result = ctx
        .http_client
        .post(&subscription.url)
        .timeout(subscription.timeout)
        .header("Content-Type", "application/json")
        .header("User-Agent", &ctx.config.user_agent)
        .header(SIGNATURE_HEADER, &signature)
        .header(EVENT_HEADER, delivery.event_type.as_str())
        .header(DELIVERY_ID_HEADER, delivery.id.to_string())
        .header(TIMESTAMP_HEADER, delivery.created_at.to_rfc3339())
        .body(body)
        .send()
        .await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(response) => {
            let code = response.status().as_u16();
            let body = read_body_capped(response, ctx.config.response_body_cap).await;
            let meta = ResponseMeta {
                code: Some(code),
                body: Some(body),
                latency_ms: Some(latency_ms),
            };
            if (200..300).contains(&code) {
                Ok(meta)
            } else if code == 429 || code >= 500 {
                Err((FailureKind::RemoteError(code), meta))
            } else {
                Err((FailureKind::ClientError(code), meta))
            }
        }
        Err(err) => {
            let meta = ResponseMeta {
                code: None,
                body: None,
                latency_ms: Some(latency_ms),
            };
            if err.is_timeout() {
                Err((FailureKind::Timeout, meta))
            } else {
                Err((FailureKind::Network(err.to_string()), meta))
            }
        }
    }
}

/// Read at most `cap` bytes of the response body, chunk by chunk; the rest
/// of the stream is discarded without being buffered.
async fn read_body_capped(mut response: reqwest::Response, cap: usize) -> String {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < cap {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(cap - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Exponential backoff: `base * 2^attempt_count`, capped at `max`.
///
/// Computed in milliseconds so sub-second bases behave.
pub(crate) fn backoff_delay(base: Duration, attempt_count: u32, max: Duration) -> Duration {
    let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt_count));
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    Duration::from_millis(delay_ms.min(max_ms))
}

/// Truncate to at most `cap` characters on a char boundary.
pub(crate) fn truncate(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        s.to_string()
    } else {
        s.chars().take(cap).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreResult};
    use crate::types::{DeliveryStatus, EventType, ScopeId, SubscriptionId};
    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::json;

    /// Subscription lookups fail, everything else is inert.
    struct UnavailableSubscriptions;

    #[async_trait]
    impl SubscriptionStore for UnavailableSubscriptions {
        async fn insert(&self, _subscription: &Subscription) -> StoreResult<()> {
            Ok(())
        }

        async fn get(&self, _id: SubscriptionId) -> StoreResult<Option<Subscription>> {
            Err(crate::error::WebhookError::Store(
                "subscription lookup failed".to_string(),
            ))
        }

        async fn find_matching(
            &self,
            _event_type: EventType,
            _scope_id: Option<ScopeId>,
        ) -> StoreResult<Vec<Subscription>> {
            Ok(Vec::new())
        }

        async fn set_active(&self, _id: SubscriptionId, _active: bool) -> StoreResult<()> {
            Ok(())
        }

        async fn delete(&self, _id: SubscriptionId) -> StoreResult<()> {
            Ok(())
        }

        async fn record_dispatch(&self, _id: SubscriptionId, _count: u64) -> StoreResult<()> {
            Ok(())
        }

        async fn record_attempt(
            &self,
            _id: SubscriptionId,
            _at: DateTime<Utc>,
        ) -> StoreResult<()> {
            Ok(())
        }

        async fn record_outcome(
            &self,
            _id: SubscriptionId,
            _success: bool,
            _at: DateTime<Utc>,
        ) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn internal_error_preserves_attempt_count() {
        let deliveries = Arc::new(MemoryStore::new());
        let delivery = Delivery::new(SubscriptionId::new(), EventType::AgentCreated, json!({}));
        deliveries.create(&delivery).await.unwrap();
        deliveries
            .mark_retrying(
                delivery.id,
                2,
                Utc::now() + chrono::Duration::seconds(60),
                "request timed out",
                ResponseMeta::none(),
            )
            .await
            .unwrap();

        let (schedule_tx, _schedule_rx) = mpsc::channel(8);
        let ctx = WorkerContext {
            subscriptions: Arc::new(UnavailableSubscriptions),
            deliveries: deliveries.clone(),
            http_client: reqwest::Client::new(),
            schedule_tx,
            config: DispatcherConfig::default(),
        };

        attempt(&ctx, delivery.id).await;

        let delivery = DeliveryStore::get(deliveries.as_ref(), delivery.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        // The failure record keeps the count the delivery already earned.
        assert_eq!(delivery.attempt_count, 2);
        assert!(delivery
            .error_message
            .unwrap()
            .starts_with("internal error"));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(86_400);
        assert_eq!(backoff_delay(base, 1, max), Duration::from_secs(120));
        assert_eq!(backoff_delay(base, 2, max), Duration::from_secs(240));
        assert_eq!(backoff_delay(base, 3, max), Duration::from_secs(480));
    }

    #[test]
    fn backoff_handles_subsecond_base() {
        let base = Duration::from_millis(50);
        let max = Duration::from_secs(86_400);
        assert_eq!(backoff_delay(base, 1, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2, max), Duration::from_millis(200));
    }

    #[test]
    fn backoff_caps_at_max() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(base, 10, max), Duration::from_secs(300));
        // Large exponents must not overflow.
        assert_eq!(backoff_delay(base, 63, max), Duration::from_secs(300));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("héllo", 2), "hé");
    }
}
