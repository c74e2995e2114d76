//! Embeddable webhook delivery engine.
//!
//! Subscriptions register interest in platform events; triggering an event
//! fans it out to every matching subscription as an HMAC-SHA256-signed
//! HTTP POST, with exponential-backoff retries and a sweeper that recovers
//! work lost to crashes or full queues.
//!
//! # Guarantees
//!
//! - At-least-once delivery: an event is attempted until it succeeds or its
//!   retry budget is exhausted; duplicate attempts are possible, receivers
//!   must dedupe on `X-Webhook-Delivery-ID`.
//! - The payload is frozen at trigger time; every attempt sends the same
//!   bytes, and the signature covers exactly those bytes.
//! - Terminal delivery states (`success`, `failed`) are never left.
//! - Worker failures never escape the pool; an unexpected internal error
//!   marks the delivery failed and the worker keeps consuming.
//!
//! # Non-Guarantees
//!
//! - No ordering across deliveries, even to the same destination.
//! - Retry timing is approximate: backoff plus jitter, observed by a
//!   scheduler and a periodic sweeper.
//! - No exactly-once semantics.
//!
//! # Example
//!
//! ```no_run
//! use webhook_relay::{Dispatcher, DispatcherConfig, EventType, NewSubscription, OwnerId};
//!
//! # async fn demo() -> Result<(), webhook_relay::WebhookError> {
//! let mut dispatcher = Dispatcher::new(DispatcherConfig::default());
//!
//! let subscription = dispatcher
//!     .create_subscription(
//!         NewSubscription::new(OwnerId::new(), "https://example.com/hooks")
//!             .with_event_type(EventType::AgentCreated),
//!     )
//!     .await?;
//!
//! dispatcher
//!     .trigger(
//!         EventType::AgentCreated,
//!         serde_json::json!({"agent_id": "a-1", "name": "support-bot"}),
//!         None,
//!     )
//!     .await?;
//!
//! dispatcher.shutdown().await;
//! # let _ = subscription;
//! # Ok(())
//! # }
//! ```

mod dispatcher;
mod error;
mod signing;
mod store;
#[cfg(feature = "postgres")]
mod store_postgres;
mod sweeper;
mod types;
mod worker;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{FailureKind, VerificationError, WebhookError};
pub use signing::{
    generate_secret, payload_bytes, sign, verify, verify_request, SIGNATURE_HEADER,
};
pub use store::{DeliveryStore, MemoryStore, ResponseMeta, StoreResult, SubscriptionStore};
#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
pub use sweeper::Sweeper;
pub use types::{
    Delivery, DeliveryId, DeliveryStatus, EventType, NewSubscription, OwnerId, ScopeId,
    Subscription, SubscriptionId,
};
pub use worker::{DELIVERY_ID_HEADER, EVENT_HEADER, TIMESTAMP_HEADER};
