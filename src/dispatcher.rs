//! Engine facade: subscription management, event fan-out, and the
//! background tasks (worker pool, retry scheduler, sweeper).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::WebhookError;
use crate::signing::generate_secret;
use crate::store::{DeliveryStore, MemoryStore, SubscriptionStore};
use crate::sweeper::Sweeper;
use crate::types::{
    Delivery, DeliveryId, EventType, NewSubscription, ScopeId, Subscription, SubscriptionId,
};
use crate::worker::{worker_loop, ScheduledRetry, WorkerContext};

/// Tuning knobs for the engine. `Default` is sized for a small embedded
/// deployment.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,
    /// Capacity of the ready queue between trigger and workers.
    pub queue_size: usize,
    /// Upper bound of the random jitter added to each backoff delay.
    pub retry_jitter_ms: u64,
    /// Hard cap on a single backoff delay.
    pub max_backoff: Duration,
    /// Stored response bodies are truncated to this many characters.
    pub response_body_cap: usize,
    /// Stored error messages are truncated to this many characters.
    pub error_cap: usize,
    /// How often the sweeper scans for due retries and orphans.
    pub sweep_interval: Duration,
    /// Age after which an unattempted `pending` delivery is re-enqueued.
    pub pending_grace: Duration,
    /// Successful deliveries older than this are purged by the sweeper.
    /// `None` disables cleanup.
    pub cleanup_retention: Option<Duration>,
    /// `User-Agent` sent with every delivery.
    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_size: 1024,
            retry_jitter_ms: 250,
            max_backoff: Duration::from_secs(86_400),
            response_body_cap: 10 * 1024,
            error_cap: 1024,
            sweep_interval: Duration::from_secs(60),
            pending_grace: Duration::from_secs(120),
            cleanup_retention: Some(Duration::from_secs(30 * 24 * 3600)),
            user_agent: "WebhookRelay-Webhook/1.0".to_string(),
        }
    }
}

/// Heap entry for the in-process retry scheduler. Reversed ordering turns
/// `BinaryHeap` into a min-heap on `ready_at`.
struct TimedRetry {
    ready_at: tokio::time::Instant,
    delivery_id: DeliveryId,
}

impl PartialEq for TimedRetry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.delivery_id == other.delivery_id
    }
}

impl Eq for TimedRetry {}

impl PartialOrd for TimedRetry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedRetry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at)
    }
}

/// The webhook delivery engine.
///
/// Owns the stores and background tasks. Dropping without calling
/// [`Dispatcher::shutdown`] aborts in-flight work unceremoniously; leased
/// deliveries are recovered by the sweeper on the next start.
pub struct Dispatcher {
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryStore>,
    ready_tx: Option<mpsc::Sender<DeliveryId>>,
    is_running: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    worker_handles: Vec<JoinHandle<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
    sweeper_handle: Option<JoinHandle<()>>,
    sweeper: Sweeper,
}

impl Dispatcher {
    /// Start an engine backed by the in-memory store.
    pub fn new(config: DispatcherConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_stores(config, store.clone(), store)
    }

    /// Start an engine over caller-provided stores.
    pub fn with_stores(
        config: DispatcherConfig,
        subscriptions: Arc<dyn SubscriptionStore>,
        deliveries: Arc<dyn DeliveryStore>,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel::<DeliveryId>(config.queue_size);
        let (schedule_tx, schedule_rx) = mpsc::channel::<ScheduledRetry>(config.queue_size);
        let is_running = Arc::new(AtomicBool::new(true));
        let shutdown_notify = Arc::new(Notify::new());

        let ctx = Arc::new(WorkerContext {
            subscriptions: subscriptions.clone(),
            deliveries: deliveries.clone(),
            http_client: reqwest::Client::new(),
            schedule_tx,
            config: config.clone(),
        });

        let ready_rx = Arc::new(Mutex::new(ready_rx));
        let worker_handles = (0..config.worker_count.max(1))
            .map(|_| tokio::spawn(worker_loop(ready_rx.clone(), ctx.clone())))
            .collect();

        let scheduler_handle = tokio::spawn(scheduler_loop(
            schedule_rx,
            ready_tx.clone(),
            is_running.clone(),
            shutdown_notify.clone(),
        ));

        let sweeper = Sweeper::new(
            subscriptions.clone(),
            deliveries.clone(),
            ready_tx.downgrade(),
            config.pending_grace,
        );
        let sweeper_handle = tokio::spawn(sweeper.clone().run(
            config.sweep_interval,
            config.cleanup_retention,
            is_running.clone(),
            shutdown_notify.clone(),
        ));

        info!(
            target: "webhook_delivery",
            workers = config.worker_count.max(1),
            queue_size = config.queue_size,
            "dispatcher started"
        );

        Self {
            subscriptions,
            deliveries,
            ready_tx: Some(ready_tx),
            is_running,
            shutdown_notify,
            worker_handles,
            scheduler_handle: Some(scheduler_handle),
            sweeper_handle: Some(sweeper_handle),
            sweeper,
        }
    }

    /// Validate and register a subscription, generating a signing secret
    /// when the request does not carry one.
    pub async fn create_subscription(
        &self,
        request: NewSubscription,
    ) -> Result<Subscription, WebhookError> {
        validate_url(&request.url)?;
        if request.event_types.is_empty() {
            return Err(WebhookError::EmptyEventTypes);
        }

        let subscription = Subscription {
            id: SubscriptionId::new(),
            owner: request.owner,
            scope_id: request.scope_id,
            url: request.url,
            event_types: request.event_types,
            secret: request.secret.unwrap_or_else(generate_secret),
            active: true,
            max_retries: request.max_retries,
            retry_base: request.retry_base,
            timeout: request.timeout,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            last_delivery_at: None,
            last_success_at: None,
            created_at: Utc::now(),
        };
        self.subscriptions.insert(&subscription).await?;
        info!(
            target: "webhook_delivery",
            subscription_id = %subscription.id,
            url = %subscription.url,
            events = subscription.event_types.len(),
            "subscription created"
        );
        Ok(subscription)
    }

    pub async fn subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, WebhookError> {
        self.subscriptions.get(id).await
    }

    pub async fn set_subscription_active(
        &self,
        id: SubscriptionId,
        active: bool,
    ) -> Result<(), WebhookError> {
        self.subscriptions.set_active(id, active).await
    }

    /// Delete a subscription and all of its delivery records.
    pub async fn delete_subscription(&self, id: SubscriptionId) -> Result<(), WebhookError> {
        self.subscriptions.delete(id).await?;
        let removed = self.deliveries.delete_for_subscription(id).await?;
        debug!(
            target: "webhook_delivery",
            subscription_id = %id,
            deliveries_removed = removed,
            "subscription deleted"
        );
        Ok(())
    }

    /// Fan an event out to every matching subscription.
    ///
    /// Creates one pending delivery per match with its own frozen copy of
    /// the payload, then enqueues them for immediate attempt. Returns the
    /// created delivery ids.
    pub async fn trigger(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        scope_id: Option<ScopeId>,
    ) -> Result<Vec<DeliveryId>, WebhookError> {
        if !self.is_running.load(AtomicOrdering::SeqCst) {
            return Err(WebhookError::Shutdown);
        }
        let Some(ready_tx) = self.ready_tx.as_ref() else {
            return Err(WebhookError::Shutdown);
        };

        let matching = self.subscriptions.find_matching(event_type, scope_id).await?;
        let mut delivery_ids = Vec::with_capacity(matching.len());
        for subscription in &matching {
            let delivery = Delivery::new(subscription.id, event_type, payload.clone());
            self.deliveries.create(&delivery).await?;
            self.subscriptions.record_dispatch(subscription.id, 1).await?;
            delivery_ids.push(delivery.id);

            match ready_tx.try_send(delivery.id) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // Persisted as pending; the sweeper re-enqueues it after
                    // the grace period.
                    warn!(
                        target: "webhook_delivery",
                        delivery_id = %delivery.id,
                        "ready queue full, delivery deferred to sweeper"
                    );
                }
                Err(TrySendError::Closed(_)) => return Err(WebhookError::Shutdown),
            }
        }

        debug!(
            target: "webhook_delivery",
            event = %event_type,
            matched = matching.len(),
            "event triggered"
        );
        Ok(delivery_ids)
    }

    pub async fn delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, WebhookError> {
        self.deliveries.get(id).await
    }

    pub async fn deliveries_for_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Vec<Delivery>, WebhookError> {
        self.deliveries.list_for_subscription(id).await
    }

    /// Direct handle to the sweeper, mainly for on-demand sweeps.
    pub fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }

    /// Stop background tasks and wait for in-flight attempts to settle.
    ///
    /// Retries still pending after shutdown stay persisted as `retrying`
    /// and are picked up on the next start.
    pub async fn shutdown(&mut self) {
        if !self.is_running.swap(false, AtomicOrdering::SeqCst) {
            return;
        }
        self.shutdown_notify.notify_waiters();

        if let Some(handle) = self.sweeper_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }
        // Closing the ready queue lets workers drain it and exit.
        self.ready_tx.take();
        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
        info!(target: "webhook_delivery", "dispatcher stopped");
    }
}

/// Hold scheduled retries until they are due, then move them to the ready
/// queue. The persisted `next_retry_at` remains the source of truth; losing
/// a heap entry only delays the retry until the sweeper finds it.
async fn scheduler_loop(
    mut schedule_rx: mpsc::Receiver<ScheduledRetry>,
    ready_tx: mpsc::Sender<DeliveryId>,
    is_running: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
) {
    let mut heap: BinaryHeap<TimedRetry> = BinaryHeap::new();
    loop {
        // Register for the shutdown notification before checking the flag,
        // otherwise a notify between check and select is lost.
        let notified = shutdown_notify.notified();
        tokio::pin!(notified);
        if !is_running.load(AtomicOrdering::SeqCst) {
            return;
        }
        let next_ready = heap.peek().map(|t| t.ready_at);

        tokio::select! {
            _ = &mut notified => {}
            message = schedule_rx.recv() => match message {
                Some(retry) => heap.push(TimedRetry {
                    ready_at: retry.ready_at,
                    delivery_id: retry.delivery_id,
                }),
                None => return,
            },
            _ = tokio::time::sleep_until(next_ready.unwrap_or_else(tokio::time::Instant::now)),
                if next_ready.is_some() =>
            {
                if let Some(due) = heap.pop() {
                    if ready_tx.send(due.delivery_id).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Destination URLs must be absolute http(s) with a host.
fn validate_url(raw: &str) -> Result<(), WebhookError> {
    let parsed =
        url::Url::parse(raw).map_err(|e| WebhookError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(WebhookError::InvalidUrl(format!(
            "{raw}: scheme must be http or https"
        )));
    }
    if parsed.host_str().is_none() {
        return Err(WebhookError::InvalidUrl(format!("{raw}: missing host")));
    }
    Ok(())
}
