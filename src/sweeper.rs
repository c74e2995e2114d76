//! Periodic safety net: re-enqueues due retries, reclaims deliveries
//! orphaned in `sending`, rescues lost `pending` rows, and purges old
//! successful records.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::error::{FailureKind, WebhookError};
use crate::store::{DeliveryStore, ResponseMeta, SubscriptionStore};
use crate::types::DeliveryId;

/// Scans the delivery store for work the fast path dropped.
///
/// Holds only a weak handle to the ready queue so an idle sweeper can
/// never keep the worker pool alive during shutdown.
#[derive(Clone)]
pub struct Sweeper {
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryStore>,
    ready_tx: mpsc::WeakSender<DeliveryId>,
    pending_grace: Duration,
}

impl Sweeper {
    pub(crate) fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        deliveries: Arc<dyn DeliveryStore>,
        ready_tx: mpsc::WeakSender<DeliveryId>,
        pending_grace: Duration,
    ) -> Self {
        Self {
            subscriptions,
            deliveries,
            ready_tx,
            pending_grace,
        }
    }

    /// One sweep pass as of `now`. Returns the number of deliveries
    /// re-enqueued.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, WebhookError> {
        let mut enqueued = 0;

        for id in self.deliveries.due_retries(now).await? {
            if self.enqueue(id) {
                enqueued += 1;
            }
        }

        enqueued += self.reclaim_expired_leases(now).await?;

        let cutoff = now
            - chrono::Duration::milliseconds(self.pending_grace.as_millis().min(i64::MAX as u128) as i64);
        for id in self.deliveries.stale_pending(cutoff).await? {
            warn!(
                target: "webhook_delivery",
                delivery_id = %id,
                "rescuing pending delivery that was never attempted"
            );
            if self.enqueue(id) {
                enqueued += 1;
            }
        }

        Ok(enqueued)
    }

    /// Deliveries stuck in `sending` past their lease were orphaned by a
    /// crashed or hung worker. The interrupted attempt counts against the
    /// budget; within budget the delivery re-enters the retry loop
    /// immediately.
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, WebhookError> {
        let mut enqueued = 0;
        for id in self.deliveries.expired_leases(now).await? {
            let Some(delivery) = self.deliveries.get(id).await? else {
                continue;
            };
            let attempt_count = delivery.attempt_count + 1;
            let kind = FailureKind::LeaseExpired;

            let max_retries = self
                .subscriptions
                .get(delivery.subscription_id)
                .await?
                .map(|sub| sub.max_retries)
                .unwrap_or(0);

            if attempt_count < max_retries {
                warn!(
                    target: "webhook_delivery",
                    delivery_id = %id,
                    attempt = attempt_count,
                    "reclaiming orphaned delivery for retry"
                );
                let applied = self
                    .deliveries
                    .mark_retrying(id, attempt_count, now, &kind.to_string(), ResponseMeta::none())
                    .await?;
                if applied {
                    self.subscriptions
                        .record_attempt(delivery.subscription_id, now)
                        .await?;
                    if self.enqueue(id) {
                        enqueued += 1;
                    }
                }
            } else {
                warn!(
                    target: "webhook_delivery",
                    delivery_id = %id,
                    attempt = attempt_count,
                    "orphaned delivery exhausted its attempts"
                );
                let applied = self
                    .deliveries
                    .mark_failed(id, attempt_count, &kind.to_string(), ResponseMeta::none(), now)
                    .await?;
                if applied {
                    self.subscriptions
                        .record_outcome(delivery.subscription_id, false, now)
                        .await
                        .ok();
                }
            }
        }
        Ok(enqueued)
    }

    /// Purge successful deliveries older than `retention`. Failed records
    /// are never purged. Returns the number deleted.
    pub async fn cleanup(&self, retention: Duration) -> Result<u64, WebhookError> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(retention.as_millis().min(i64::MAX as u128) as i64);
        let purged = self.deliveries.purge_succeeded_before(cutoff).await?;
        if purged > 0 {
            info!(target: "webhook_delivery", purged, "purged old successful deliveries");
        }
        Ok(purged)
    }

    fn enqueue(&self, id: DeliveryId) -> bool {
        let Some(tx) = self.ready_tx.upgrade() else {
            return false;
        };
        match tx.try_send(id) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                // Left persisted; the next sweep will retry the enqueue.
                debug!(
                    target: "webhook_delivery",
                    delivery_id = %id,
                    "ready queue full during sweep"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) async fn run(
        self,
        interval: Duration,
        retention: Option<Duration>,
        is_running: Arc<AtomicBool>,
        shutdown_notify: Arc<Notify>,
    ) {
        loop {
            // Register for the shutdown notification before checking the
            // flag, otherwise a notify during a sweep is lost.
            let notified = shutdown_notify.notified();
            tokio::pin!(notified);
            if !is_running.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(interval) => {
                    match self.sweep(Utc::now()).await {
                        Ok(enqueued) if enqueued > 0 => {
                            debug!(target: "webhook_delivery", enqueued, "sweep re-enqueued deliveries");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            error!(target: "webhook_delivery", error = %err, "sweep failed");
                        }
                    }
                    if let Some(retention) = retention {
                        if let Err(err) = self.cleanup(retention).await {
                            error!(target: "webhook_delivery", error = %err, "cleanup failed");
                        }
                    }
                }
            }
        }
    }
}
