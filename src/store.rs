//! Repository interfaces for subscriptions and delivery records.
//!
//! The engine never reaches into a database directly; the dispatcher,
//! workers, and sweeper all go through these traits. Counter updates are
//! single store operations so a SQL backend can express them as atomic
//! `UPDATE ... SET x = x + 1` statements rather than read-modify-write.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::WebhookError;
use crate::types::{
    Delivery, DeliveryId, DeliveryStatus, EventType, ScopeId, Subscription, SubscriptionId,
};

pub type StoreResult<T> = Result<T, WebhookError>;

/// Response metadata recorded on a delivery after an attempt.
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    pub code: Option<u16>,
    pub body: Option<String>,
    pub latency_ms: Option<u64>,
}

impl ResponseMeta {
    /// No response was received (network error, or no attempt was made).
    pub fn none() -> Self {
        Self::default()
    }
}

/// Persistence for subscription records.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert(&self, subscription: &Subscription) -> StoreResult<()>;

    async fn get(&self, id: SubscriptionId) -> StoreResult<Option<Subscription>>;

    /// All active subscriptions matching the event, looked up via an index
    /// on event type rather than a scan of every record.
    async fn find_matching(
        &self,
        event_type: EventType,
        scope_id: Option<ScopeId>,
    ) -> StoreResult<Vec<Subscription>>;

    async fn set_active(&self, id: SubscriptionId, active: bool) -> StoreResult<()>;

    async fn delete(&self, id: SubscriptionId) -> StoreResult<()>;

    /// Atomically add `count` to `total_deliveries`.
    async fn record_dispatch(&self, id: SubscriptionId, count: u64) -> StoreResult<()>;

    /// Update `last_delivery_at` after a non-terminal attempt.
    async fn record_attempt(&self, id: SubscriptionId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Atomically record a terminal outcome: bump the success or failure
    /// counter and update the last-delivery (and last-success) timestamps.
    async fn record_outcome(
        &self,
        id: SubscriptionId,
        success: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

/// Persistence for delivery records.
///
/// State transitions are dedicated methods so each maps to one UPDATE.
///
/// The `mark_*` transitions are conditional writes: a delivery that has
/// reached a terminal status is never modified again, so a stale worker
/// write (the scheduler and the sweeper may enqueue the same id) cannot
/// resurrect a settled delivery. Each returns whether the write was
/// applied; callers must only perform follow-up effects (counters,
/// re-scheduling) when it was.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn create(&self, delivery: &Delivery) -> StoreResult<()>;

    async fn get(&self, id: DeliveryId) -> StoreResult<Option<Delivery>>;

    /// Claim the delivery for an attempt: transition to `Sending` and
    /// stamp the crash-recovery lease.
    ///
    /// Applies only from `pending` or `retrying`. `false` means the
    /// delivery is missing, already settled, or claimed by another worker.
    async fn mark_sending(
        &self,
        id: DeliveryId,
        lease_expires_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Applies only while non-terminal.
    async fn mark_success(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        response: ResponseMeta,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Applies only while non-terminal.
    async fn mark_retrying(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        response: ResponseMeta,
    ) -> StoreResult<bool>;

    /// Applies only while non-terminal.
    async fn mark_failed(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        error: &str,
        response: ResponseMeta,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Retrying deliveries whose scheduled retry time has passed.
    async fn due_retries(&self, now: DateTime<Utc>) -> StoreResult<Vec<DeliveryId>>;

    /// Sending deliveries whose lease expired (orphaned by a dead worker).
    async fn expired_leases(&self, now: DateTime<Utc>) -> StoreResult<Vec<DeliveryId>>;

    /// Pending deliveries created before `cutoff` that were never attempted
    /// (the enqueue was lost, e.g. to a full queue).
    async fn stale_pending(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DeliveryId>>;

    /// Delete successful deliveries older than `cutoff`; failed records are
    /// kept for diagnostics. Returns the number deleted.
    async fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Cascade used when a subscription is deleted.
    async fn delete_for_subscription(&self, id: SubscriptionId) -> StoreResult<u64>;

    async fn list_for_subscription(&self, id: SubscriptionId) -> StoreResult<Vec<Delivery>>;
}

#[derive(Default)]
struct MemoryInner {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    by_event: HashMap<EventType, BTreeSet<SubscriptionId>>,
    deliveries: HashMap<DeliveryId, Delivery>,
}

/// In-memory store for embedded deployments and tests.
///
/// Implements both repository traits behind a single lock, which makes the
/// counter updates trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn insert(&self, subscription: &Subscription) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        for event_type in &subscription.event_types {
            inner
                .by_event
                .entry(*event_type)
                .or_default()
                .insert(subscription.id);
        }
        inner
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get(&self, id: SubscriptionId) -> StoreResult<Option<Subscription>> {
        let inner = self.inner.lock().await;
        Ok(inner.subscriptions.get(&id).cloned())
    }

    async fn find_matching(
        &self,
        event_type: EventType,
        scope_id: Option<ScopeId>,
    ) -> StoreResult<Vec<Subscription>> {
        let inner = self.inner.lock().await;
        let Some(ids) = inner.by_event.get(&event_type) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.subscriptions.get(id))
            .filter(|sub| sub.matches(event_type, scope_id))
            .cloned()
            .collect())
    }

    async fn set_active(&self, id: SubscriptionId, active: bool) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let sub = inner
            .subscriptions
            .get_mut(&id)
            .ok_or(WebhookError::SubscriptionNotFound(id))?;
        sub.active = active;
        Ok(())
    }

    async fn delete(&self, id: SubscriptionId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.subscriptions.remove(&id);
        for ids in inner.by_event.values_mut() {
            ids.remove(&id);
        }
        Ok(())
    }

    async fn record_dispatch(&self, id: SubscriptionId, count: u64) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let sub = inner
            .subscriptions
            .get_mut(&id)
            .ok_or(WebhookError::SubscriptionNotFound(id))?;
        sub.total_deliveries += count;
        Ok(())
    }

    async fn record_attempt(&self, id: SubscriptionId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let sub = inner
            .subscriptions
            .get_mut(&id)
            .ok_or(WebhookError::SubscriptionNotFound(id))?;
        sub.last_delivery_at = Some(at);
        Ok(())
    }

    async fn record_outcome(
        &self,
        id: SubscriptionId,
        success: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let sub = inner
            .subscriptions
            .get_mut(&id)
            .ok_or(WebhookError::SubscriptionNotFound(id))?;
        if success {
            sub.successful_deliveries += 1;
            sub.last_success_at = Some(at);
        } else {
            sub.failed_deliveries += 1;
        }
        sub.last_delivery_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn create(&self, delivery: &Delivery) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn get(&self, id: DeliveryId) -> StoreResult<Option<Delivery>> {
        let inner = self.inner.lock().await;
        Ok(inner.deliveries.get(&id).cloned())
    }

    async fn mark_sending(
        &self,
        id: DeliveryId,
        lease_expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(delivery) = inner.deliveries.get_mut(&id) else {
            return Ok(false);
        };
        if !matches!(
            delivery.status,
            DeliveryStatus::Pending | DeliveryStatus::Retrying
        ) {
            return Ok(false);
        }
        delivery.status = DeliveryStatus::Sending;
        delivery.lease_expires_at = Some(lease_expires_at);
        delivery.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_success(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        response: ResponseMeta,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(delivery) = inner.deliveries.get_mut(&id) else {
            return Ok(false);
        };
        if delivery.status.is_terminal() {
            return Ok(false);
        }
        delivery.status = DeliveryStatus::Success;
        delivery.attempt_count = attempt_count;
        delivery.next_retry_at = None;
        delivery.lease_expires_at = None;
        delivery.response_code = response.code;
        delivery.response_body = response.body;
        delivery.latency_ms = response.latency_ms;
        delivery.error_message = None;
        delivery.delivered_at = Some(at);
        delivery.updated_at = at;
        Ok(true)
    }

    async fn mark_retrying(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        response: ResponseMeta,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(delivery) = inner.deliveries.get_mut(&id) else {
            return Ok(false);
        };
        if delivery.status.is_terminal() {
            return Ok(false);
        }
        delivery.status = DeliveryStatus::Retrying;
        delivery.attempt_count = attempt_count;
        delivery.next_retry_at = Some(next_retry_at);
        delivery.lease_expires_at = None;
        delivery.response_code = response.code;
        delivery.response_body = response.body;
        delivery.latency_ms = response.latency_ms;
        delivery.error_message = Some(error.to_string());
        delivery.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        error: &str,
        response: ResponseMeta,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(delivery) = inner.deliveries.get_mut(&id) else {
            return Ok(false);
        };
        if delivery.status.is_terminal() {
            return Ok(false);
        }
        delivery.status = DeliveryStatus::Failed;
        delivery.attempt_count = attempt_count;
        delivery.next_retry_at = None;
        delivery.lease_expires_at = None;
        delivery.response_code = response.code;
        delivery.response_body = response.body;
        delivery.latency_ms = response.latency_ms;
        delivery.error_message = Some(error.to_string());
        delivery.updated_at = at;
        Ok(true)
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> StoreResult<Vec<DeliveryId>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Retrying
                    && d.next_retry_at.is_some_and(|at| at <= now)
            })
            .map(|d| d.id)
            .collect())
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> StoreResult<Vec<DeliveryId>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Sending
                    && d.lease_expires_at.is_some_and(|at| at <= now)
            })
            .map(|d| d.id)
            .collect())
    }

    async fn stale_pending(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DeliveryId>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deliveries
            .values()
            .filter(|d| d.status == DeliveryStatus::Pending && d.created_at <= cutoff)
            .map(|d| d.id)
            .collect())
    }

    async fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.deliveries.len();
        inner.deliveries.retain(|_, d| {
            !(d.status == DeliveryStatus::Success
                && d.delivered_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - inner.deliveries.len()) as u64)
    }

    async fn delete_for_subscription(&self, id: SubscriptionId) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.deliveries.len();
        inner.deliveries.retain(|_, d| d.subscription_id != id);
        Ok((before - inner.deliveries.len()) as u64)
    }

    async fn list_for_subscription(&self, id: SubscriptionId) -> StoreResult<Vec<Delivery>> {
        let inner = self.inner.lock().await;
        let mut deliveries: Vec<Delivery> = inner
            .deliveries
            .values()
            .filter(|d| d.subscription_id == id)
            .cloned()
            .collect();
        deliveries.sort_by_key(|d| d.created_at);
        Ok(deliveries)
    }
}
