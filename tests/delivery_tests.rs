mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, wait_for_status};
use serde_json::json;
use webhook_relay::{
    payload_bytes, verify, DeliveryStatus, Dispatcher, EventType, MemoryStore, NewSubscription,
    OwnerId, ScopeId, SubscriptionStore, DELIVERY_ID_HEADER, EVENT_HEADER, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn delivers_signed_event_to_matching_subscription() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut dispatcher = Dispatcher::new(fast_config());
    let subscription = dispatcher
        .create_subscription(
            NewSubscription::new(OwnerId::new(), format!("{}/hook", server.uri()))
                .with_event_type(EventType::AgentCreated)
                .with_secret("test-secret"),
        )
        .await
        .unwrap();

    let payload = json!({"agent_id": "a-1", "name": "support-bot"});
    let ids = dispatcher
        .trigger(EventType::AgentCreated, payload.clone(), None)
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let delivery = wait_for_status(&dispatcher, ids[0], DeliveryStatus::Success).await;
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(delivery.response_code, Some(200));
    assert!(delivery.delivered_at.is_some());
    assert!(delivery.latency_ms.is_some());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.body, payload_bytes(&payload));

    let header = |name: &str| {
        request
            .headers
            .get(name)
            .unwrap_or_else(|| panic!("missing header {name}"))
            .to_str()
            .unwrap()
            .to_string()
    };
    assert!(verify("test-secret", &request.body, &header(SIGNATURE_HEADER)));
    assert_eq!(header(EVENT_HEADER), "agent.created");
    assert_eq!(header(DELIVERY_ID_HEADER), ids[0].to_string());
    assert!(chrono::DateTime::parse_from_rfc3339(&header(TIMESTAMP_HEADER)).is_ok());
    assert_eq!(header("Content-Type"), "application/json");
    assert!(header("User-Agent").contains("Webhook/1.0"));

    let subscription = dispatcher
        .subscription(subscription.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.total_deliveries, 1);
    assert_eq!(subscription.successful_deliveries, 1);
    assert_eq!(subscription.failed_deliveries, 0);
    assert!(subscription.last_success_at.is_some());

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn oversized_response_body_is_capped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(100 * 1024)))
        .mount(&server)
        .await;

    let mut dispatcher = Dispatcher::new(fast_config());
    dispatcher
        .create_subscription(
            NewSubscription::new(OwnerId::new(), format!("{}/hook", server.uri()))
                .with_event_type(EventType::AgentCreated),
        )
        .await
        .unwrap();

    let ids = dispatcher
        .trigger(EventType::AgentCreated, json!({}), None)
        .await
        .unwrap();

    let delivery = wait_for_status(&dispatcher, ids[0], DeliveryStatus::Success).await;
    let body = delivery.response_body.unwrap();
    assert_eq!(body.len(), 10 * 1024);
    assert!(body.bytes().all(|b| b == b'x'));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn unmatched_event_creates_no_deliveries() {
    let server = MockServer::start().await;
    let mut dispatcher = Dispatcher::new(fast_config());
    dispatcher
        .create_subscription(
            NewSubscription::new(OwnerId::new(), format!("{}/hook", server.uri()))
                .with_event_type(EventType::AgentCreated),
        )
        .await
        .unwrap();

    let ids = dispatcher
        .trigger(EventType::MessageReceived, json!({"text": "hi"}), None)
        .await
        .unwrap();
    assert!(ids.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.received_requests().await.unwrap().is_empty());

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn scope_filters_fanout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut dispatcher = Dispatcher::new(fast_config());
    let scope = ScopeId::new();
    let _unscoped = dispatcher
        .create_subscription(
            NewSubscription::new(OwnerId::new(), format!("{}/all", server.uri()))
                .with_event_type(EventType::ConversationStarted),
        )
        .await
        .unwrap();
    let _scoped = dispatcher
        .create_subscription(
            NewSubscription::new(OwnerId::new(), format!("{}/one", server.uri()))
                .with_event_type(EventType::ConversationStarted)
                .with_scope(scope),
        )
        .await
        .unwrap();

    // A scoped event reaches the unscoped subscription and the matching
    // scoped one.
    let ids = dispatcher
        .trigger(EventType::ConversationStarted, json!({}), Some(scope))
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    // An unscoped event never reaches a scoped subscription.
    let ids = dispatcher
        .trigger(EventType::ConversationStarted, json!({}), None)
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    // A differently-scoped event reaches only the unscoped subscription.
    let ids = dispatcher
        .trigger(
            EventType::ConversationStarted,
            json!({}),
            Some(ScopeId::new()),
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn inactive_subscription_fails_at_attempt_time() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let mut dispatcher = Dispatcher::with_stores(fast_config(), store.clone(), store.clone());
    let subscription = dispatcher
        .create_subscription(
            NewSubscription::new(OwnerId::new(), format!("{}/hook", server.uri()))
                .with_event_type(EventType::AgentCreated),
        )
        .await
        .unwrap();

    // Enqueue a delivery by hand, then deactivate before it is attempted.
    let delivery = webhook_relay::Delivery::new(
        subscription.id,
        EventType::AgentCreated,
        json!({"agent_id": "a-1"}),
    );
    webhook_relay::DeliveryStore::create(store.as_ref(), &delivery)
        .await
        .unwrap();
    dispatcher
        .set_subscription_active(subscription.id, false)
        .await
        .unwrap();

    // Rescue it through the sweeper once it is past the pending grace.
    let later = chrono::Utc::now() + chrono::Duration::seconds(300);
    assert_eq!(dispatcher.sweeper().sweep(later).await.unwrap(), 1);

    let delivery = wait_for_status(&dispatcher, delivery.id, DeliveryStatus::Failed).await;
    assert_eq!(
        delivery.error_message.as_deref(),
        Some("subscription inactive")
    );
    assert!(delivery.response_code.is_none());
    assert!(server.received_requests().await.unwrap().is_empty());

    let subscription = SubscriptionStore::get(store.as_ref(), subscription.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.failed_deliveries, 1);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn delete_subscription_cascades() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut dispatcher = Dispatcher::new(fast_config());
    let subscription = dispatcher
        .create_subscription(
            NewSubscription::new(OwnerId::new(), format!("{}/hook", server.uri()))
                .with_event_type(EventType::UserDeleted),
        )
        .await
        .unwrap();

    let ids = dispatcher
        .trigger(EventType::UserDeleted, json!({"user_id": "u-1"}), None)
        .await
        .unwrap();
    wait_for_status(&dispatcher, ids[0], DeliveryStatus::Success).await;

    dispatcher.delete_subscription(subscription.id).await.unwrap();
    assert!(dispatcher
        .subscription(subscription.id)
        .await
        .unwrap()
        .is_none());
    assert!(dispatcher
        .deliveries_for_subscription(subscription.id)
        .await
        .unwrap()
        .is_empty());

    // Further triggers match nothing.
    let ids = dispatcher
        .trigger(EventType::UserDeleted, json!({}), None)
        .await
        .unwrap();
    assert!(ids.is_empty());

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn rejects_invalid_subscriptions() {
    let mut dispatcher = Dispatcher::new(fast_config());

    let err = dispatcher
        .create_subscription(
            NewSubscription::new(OwnerId::new(), "ftp://example.com/hook")
                .with_event_type(EventType::AgentCreated),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, webhook_relay::WebhookError::InvalidUrl(_)));

    let err = dispatcher
        .create_subscription(NewSubscription::new(OwnerId::new(), "https://example.com/hook"))
        .await
        .unwrap_err();
    assert!(matches!(err, webhook_relay::WebhookError::EmptyEventTypes));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn generated_secret_is_strong() {
    let mut dispatcher = Dispatcher::new(fast_config());
    let subscription = dispatcher
        .create_subscription(
            NewSubscription::new(OwnerId::new(), "https://example.com/hook")
                .with_event_type(EventType::AgentCreated),
        )
        .await
        .unwrap();
    // 32 bytes of entropy as URL-safe base64.
    assert!(subscription.secret.len() >= 43);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn trigger_after_shutdown_is_rejected() {
    let mut dispatcher = Dispatcher::new(fast_config());
    dispatcher.shutdown().await;
    let err = dispatcher
        .trigger(EventType::AgentCreated, json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, webhook_relay::WebhookError::Shutdown));
}
