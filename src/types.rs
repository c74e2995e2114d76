use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WebhookError;

/// Unique identifier for a subscription.
///
/// Strongly-typed wrapper to avoid accidental mixing of subscription ids
/// with other UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

/// Unique identifier for a delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

/// Identity of the user owning a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub Uuid);

/// Identifier of the upstream entity a subscription may be scoped to
/// (e.g. one agent rather than all agents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub Uuid);

macro_rules! impl_id {
    ($name:ident) => {
        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

impl_id!(SubscriptionId);
impl_id!(DeliveryId);
impl_id!(OwnerId);
impl_id!(ScopeId);

/// Closed enumeration of event types the platform emits.
///
/// Subscriptions reference these by wire name (e.g. `"agent.created"`);
/// unknown names are rejected at subscription creation, so a typo can never
/// silently match nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "agent.created")]
    AgentCreated,
    #[serde(rename = "agent.updated")]
    AgentUpdated,
    #[serde(rename = "agent.deleted")]
    AgentDeleted,
    #[serde(rename = "conversation.started")]
    ConversationStarted,
    #[serde(rename = "conversation.completed")]
    ConversationCompleted,
    #[serde(rename = "message.received")]
    MessageReceived,
    #[serde(rename = "user.registered")]
    UserRegistered,
    #[serde(rename = "user.deleted")]
    UserDeleted,
}

impl EventType {
    /// All known event types, in wire-name order.
    pub const ALL: [EventType; 8] = [
        EventType::AgentCreated,
        EventType::AgentUpdated,
        EventType::AgentDeleted,
        EventType::ConversationStarted,
        EventType::ConversationCompleted,
        EventType::MessageReceived,
        EventType::UserRegistered,
        EventType::UserDeleted,
    ];

    /// Wire name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentCreated => "agent.created",
            EventType::AgentUpdated => "agent.updated",
            EventType::AgentDeleted => "agent.deleted",
            EventType::ConversationStarted => "conversation.started",
            EventType::ConversationCompleted => "conversation.completed",
            EventType::MessageReceived => "message.received",
            EventType::UserRegistered => "user.registered",
            EventType::UserDeleted => "user.deleted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| WebhookError::UnknownEventType(s.to_string()))
    }
}

/// A registered interest in a set of event types, bound to a destination
/// URL and signing secret.
///
/// The secret is generated once at creation and immutable thereafter.
/// Counters are fast-path statistics maintained by atomic store updates;
/// the delivery records remain the audit source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub owner: OwnerId,

    /// When set, only events carrying this scope are delivered.
    pub scope_id: Option<ScopeId>,

    /// Destination URL for HTTP POST delivery.
    pub url: String,

    /// Event types this subscription receives.
    pub event_types: BTreeSet<EventType>,

    /// HMAC-SHA256 signing secret. Never empty.
    pub secret: String,

    /// Inactive subscriptions match no events; in-flight deliveries to them
    /// fail at attempt time without retry.
    pub active: bool,

    /// Maximum total delivery attempts per event.
    pub max_retries: u32,

    /// Base delay for exponential backoff.
    pub retry_base: Duration,

    /// Per-attempt HTTP timeout.
    pub timeout: Duration,

    pub total_deliveries: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// True iff this subscription should receive the given event.
    ///
    /// Requires the subscription to be active, the event type subscribed,
    /// and the scope to match (a scoped subscription never matches an
    /// unscoped or differently-scoped event).
    pub fn matches(&self, event_type: EventType, scope_id: Option<ScopeId>) -> bool {
        self.active
            && self.event_types.contains(&event_type)
            && match self.scope_id {
                None => true,
                Some(own) => scope_id == Some(own),
            }
    }
}

/// Request to create a subscription.
///
/// Defaults: 3 max retries, 60 s base retry delay, 10 s request timeout,
/// secret generated from OS entropy.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub owner: OwnerId,
    pub url: String,
    pub event_types: BTreeSet<EventType>,
    pub scope_id: Option<ScopeId>,
    pub secret: Option<String>,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub timeout: Duration,
}

impl NewSubscription {
    pub fn new(owner: OwnerId, url: impl Into<String>) -> Self {
        Self {
            owner,
            url: url.into(),
            event_types: BTreeSet::new(),
            scope_id: None,
            secret: None,
            max_retries: 3,
            retry_base: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
        }
    }

    /// Subscribe to a single event type (may be called repeatedly).
    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_types.insert(event_type);
        self
    }

    /// Subscribe to a set of event types.
    pub fn with_event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types.extend(types);
        self
    }

    /// Restrict delivery to events carrying this scope.
    pub fn with_scope(mut self, scope_id: ScopeId) -> Self {
        self.scope_id = Some(scope_id);
        self
    }

    /// Provide a signing secret instead of generating one.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Success,
    Failed,
    Retrying,
}

impl DeliveryStatus {
    /// Terminal states are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Retrying => "retrying",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sending" => Ok(DeliveryStatus::Sending),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            "retrying" => Ok(DeliveryStatus::Retrying),
            other => Err(WebhookError::Store(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked attempt-lifecycle of sending a single event instance to a
/// single subscription.
///
/// The payload is frozen at creation; later mutation of the source object
/// never affects what is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub subscription_id: SubscriptionId,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,

    /// Monotonically non-decreasing; incremented once per completed attempt.
    pub attempt_count: u32,

    /// Single source of truth for when the next retry is due.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Set while `Sending`; a delivery whose lease has expired is presumed
    /// orphaned by a dead worker and reclaimed by the sweeper.
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub latency_ms: Option<u64>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Delivery {
    /// Create a new pending delivery with a frozen payload snapshot.
    pub fn new(
        subscription_id: SubscriptionId,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DeliveryId::new(),
            subscription_id,
            event_type,
            payload,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            next_retry_at: None,
            lease_expires_at: None,
            response_code: None,
            response_body: None,
            latency_ms: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            delivered_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription(active: bool, scope: Option<ScopeId>) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            owner: OwnerId::new(),
            scope_id: scope,
            url: "https://example.com/hook".to_string(),
            event_types: [EventType::AgentCreated, EventType::AgentDeleted]
                .into_iter()
                .collect(),
            secret: "s3cret".to_string(),
            active,
            max_retries: 3,
            retry_base: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            last_delivery_at: None,
            last_success_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn event_type_wire_names_round_trip() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
    }

    #[test]
    fn unknown_event_type_rejected() {
        let err = "agent.creatd".parse::<EventType>().unwrap_err();
        assert!(matches!(err, WebhookError::UnknownEventType(_)));
    }

    #[test]
    fn event_type_serde_uses_wire_names() {
        let v = serde_json::to_value(EventType::AgentCreated).unwrap();
        assert_eq!(v, json!("agent.created"));
    }

    #[test]
    fn matches_requires_active() {
        let sub = subscription(false, None);
        assert!(!sub.matches(EventType::AgentCreated, None));
    }

    #[test]
    fn matches_requires_subscribed_type() {
        let sub = subscription(true, None);
        assert!(sub.matches(EventType::AgentCreated, None));
        assert!(!sub.matches(EventType::MessageReceived, None));
    }

    #[test]
    fn unscoped_subscription_matches_any_scope() {
        let sub = subscription(true, None);
        assert!(sub.matches(EventType::AgentCreated, Some(ScopeId::new())));
    }

    #[test]
    fn scoped_subscription_matches_only_its_scope() {
        let scope = ScopeId::new();
        let sub = subscription(true, Some(scope));
        assert!(sub.matches(EventType::AgentCreated, Some(scope)));
        assert!(!sub.matches(EventType::AgentCreated, Some(ScopeId::new())));
        assert!(!sub.matches(EventType::AgentCreated, None));
    }

    #[test]
    fn new_subscription_defaults() {
        let req = NewSubscription::new(OwnerId::new(), "https://example.com/hook");
        assert_eq!(req.max_retries, 3);
        assert_eq!(req.retry_base, Duration::from_secs(60));
        assert_eq!(req.timeout, Duration::from_secs(10));
        assert!(req.secret.is_none());
        assert!(req.event_types.is_empty());
    }

    #[test]
    fn delivery_starts_pending() {
        let d = Delivery::new(SubscriptionId::new(), EventType::AgentCreated, json!({}));
        assert_eq!(d.status, DeliveryStatus::Pending);
        assert_eq!(d.attempt_count, 0);
        assert!(d.next_retry_at.is_none());
        assert!(!d.status.is_terminal());
    }

    #[test]
    fn terminal_statuses() {
        assert!(DeliveryStatus::Success.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Retrying.is_terminal());
        assert!(!DeliveryStatus::Sending.is_terminal());
    }
}
