//! Error taxonomy for the webhook engine.
//!
//! Validation errors are rejected synchronously at subscription creation and
//! never enter the delivery pipeline. Delivery-path failures are represented
//! by [`FailureKind`] and recorded on the delivery row, never raised out of a
//! worker.

use crate::types::{DeliveryId, SubscriptionId};

/// Errors surfaced by the engine's public API.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("subscription has no event types")]
    EmptyEventTypes,

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("delivery not found: {0}")]
    DeliveryNotFound(DeliveryId),

    #[error("store error: {0}")]
    Store(String),

    /// Dispatcher has been shut down; no further work is accepted.
    #[error("dispatcher is shut down")]
    Shutdown,
}

/// Why a single delivery attempt failed.
///
/// Retryable kinds re-enter the backoff loop while the attempt budget lasts;
/// the rest terminate the delivery immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureKind {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    /// 5xx or 429 from the destination.
    #[error("remote endpoint returned HTTP {0}")]
    RemoteError(u16),

    /// Any other non-2xx response. Not retried.
    #[error("endpoint rejected delivery with HTTP {0}")]
    ClientError(u16),

    /// The owning subscription was deactivated or deleted between enqueue
    /// and attempt. Not retried.
    #[error("subscription inactive")]
    SubscriptionInactive,

    /// A worker died mid-`sending` and the delivery lease expired.
    #[error("delivery lease expired")]
    LeaseExpired,
}

impl FailureKind {
    /// Whether this failure re-enters the retry loop (subject to the
    /// delivery's remaining attempt budget).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::Network(_)
                | FailureKind::RemoteError(_)
                | FailureKind::LeaseExpired
        )
    }
}

/// Receiver-side signature verification failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("signature does not match payload")]
    InvalidSignature,
}
