//! PostgreSQL-backed stores for durable deployments.
//!
//! Counter updates and state transitions are single `UPDATE` statements so
//! they stay atomic under concurrent workers without explicit transactions.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::types::Json;
use tokio_postgres::{Client, Row};

use crate::error::WebhookError;
use crate::store::{DeliveryStore, ResponseMeta, StoreResult, SubscriptionStore};
use crate::types::{
    Delivery, DeliveryId, DeliveryStatus, EventType, OwnerId, ScopeId, Subscription,
    SubscriptionId,
};

impl From<tokio_postgres::Error> for WebhookError {
    fn from(err: tokio_postgres::Error) -> Self {
        WebhookError::Store(err.to_string())
    }
}

const MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS webhook_subscriptions (
    id                      UUID PRIMARY KEY,
    owner_id                UUID NOT NULL,
    scope_id                UUID,
    url                     TEXT NOT NULL,
    event_types             JSONB NOT NULL,
    secret                  TEXT NOT NULL,
    active                  BOOLEAN NOT NULL,
    max_retries             INTEGER NOT NULL,
    retry_base_ms           BIGINT NOT NULL,
    timeout_ms              BIGINT NOT NULL,
    total_deliveries        BIGINT NOT NULL DEFAULT 0,
    successful_deliveries   BIGINT NOT NULL DEFAULT 0,
    failed_deliveries       BIGINT NOT NULL DEFAULT 0,
    last_delivery_at        TIMESTAMPTZ,
    last_success_at         TIMESTAMPTZ,
    created_at              TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS webhook_subscriptions_event_types_idx
    ON webhook_subscriptions USING GIN (event_types);

CREATE TABLE IF NOT EXISTS webhook_deliveries (
    id              UUID PRIMARY KEY,
    subscription_id UUID NOT NULL,
    event_type      TEXT NOT NULL,
    payload         JSONB NOT NULL,
    status          TEXT NOT NULL,
    attempt_count   INTEGER NOT NULL DEFAULT 0,
    next_retry_at   TIMESTAMPTZ,
    lease_expires_at TIMESTAMPTZ,
    response_code   INTEGER,
    response_body   TEXT,
    latency_ms      BIGINT,
    error_message   TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    delivered_at    TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS webhook_deliveries_retry_idx
    ON webhook_deliveries (status, next_retry_at);
CREATE INDEX IF NOT EXISTS webhook_deliveries_subscription_idx
    ON webhook_deliveries (subscription_id);
"#;

/// Stores backed by a `tokio_postgres` connection.
///
/// The caller owns the connection task; this type only issues statements.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> StoreResult<()> {
        self.client.batch_execute(MIGRATION).await?;
        Ok(())
    }
}

fn subscription_from_row(row: &Row) -> StoreResult<Subscription> {
    let Json(event_types): Json<BTreeSet<EventType>> = row.get("event_types");
    let retry_base_ms: i64 = row.get("retry_base_ms");
    let timeout_ms: i64 = row.get("timeout_ms");
    Ok(Subscription {
        id: SubscriptionId(row.get("id")),
        owner: OwnerId(row.get("owner_id")),
        scope_id: row.get::<_, Option<uuid::Uuid>>("scope_id").map(ScopeId),
        url: row.get("url"),
        event_types,
        secret: row.get("secret"),
        active: row.get("active"),
        max_retries: row.get::<_, i32>("max_retries") as u32,
        retry_base: Duration::from_millis(retry_base_ms.max(0) as u64),
        timeout: Duration::from_millis(timeout_ms.max(0) as u64),
        total_deliveries: row.get::<_, i64>("total_deliveries") as u64,
        successful_deliveries: row.get::<_, i64>("successful_deliveries") as u64,
        failed_deliveries: row.get::<_, i64>("failed_deliveries") as u64,
        last_delivery_at: row.get("last_delivery_at"),
        last_success_at: row.get("last_success_at"),
        created_at: row.get("created_at"),
    })
}

fn delivery_from_row(row: &Row) -> StoreResult<Delivery> {
    let event_type: String = row.get("event_type");
    let status: String = row.get("status");
    Ok(Delivery {
        id: DeliveryId(row.get("id")),
        subscription_id: SubscriptionId(row.get("subscription_id")),
        event_type: event_type.parse()?,
        payload: row.get("payload"),
        status: status.parse::<DeliveryStatus>()?,
        attempt_count: row.get::<_, i32>("attempt_count") as u32,
        next_retry_at: row.get("next_retry_at"),
        lease_expires_at: row.get("lease_expires_at"),
        response_code: row.get::<_, Option<i32>>("response_code").map(|c| c as u16),
        response_body: row.get("response_body"),
        latency_ms: row.get::<_, Option<i64>>("latency_ms").map(|l| l as u64),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        delivered_at: row.get("delivered_at"),
    })
}

#[async_trait]
impl SubscriptionStore for PostgresStore {
    async fn insert(&self, subscription: &Subscription) -> StoreResult<()> {
        self.client
            .execute(
                "INSERT INTO webhook_subscriptions \
                 (id, owner_id, scope_id, url, event_types, secret, active, max_retries, \
                  retry_base_ms, timeout_ms, total_deliveries, successful_deliveries, \
                  failed_deliveries, last_delivery_at, last_success_at, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
                &[
                    &subscription.id.0,
                    &subscription.owner.0,
                    &subscription.scope_id.map(|s| s.0),
                    &subscription.url,
                    &Json(&subscription.event_types),
                    &subscription.secret,
                    &subscription.active,
                    &(subscription.max_retries as i32),
                    &(subscription.retry_base.as_millis() as i64),
                    &(subscription.timeout.as_millis() as i64),
                    &(subscription.total_deliveries as i64),
                    &(subscription.successful_deliveries as i64),
                    &(subscription.failed_deliveries as i64),
                    &subscription.last_delivery_at,
                    &subscription.last_success_at,
                    &subscription.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: SubscriptionId) -> StoreResult<Option<Subscription>> {
        let row = self
            .client
            .query_opt("SELECT * FROM webhook_subscriptions WHERE id = $1", &[&id.0])
            .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn find_matching(
        &self,
        event_type: EventType,
        scope_id: Option<ScopeId>,
    ) -> StoreResult<Vec<Subscription>> {
        let event = Json(serde_json::json!([event_type]));
        let rows = match scope_id {
            Some(scope) => {
                self.client
                    .query(
                        "SELECT * FROM webhook_subscriptions \
                         WHERE active AND event_types @> $1 \
                         AND (scope_id IS NULL OR scope_id = $2)",
                        &[&event, &scope.0],
                    )
                    .await?
            }
            None => {
                self.client
                    .query(
                        "SELECT * FROM webhook_subscriptions \
                         WHERE active AND event_types @> $1 AND scope_id IS NULL",
                        &[&event],
                    )
                    .await?
            }
        };
        rows.iter().map(subscription_from_row).collect()
    }

    async fn set_active(&self, id: SubscriptionId, active: bool) -> StoreResult<()> {
        let n = self
            .client
            .execute(
                "UPDATE webhook_subscriptions SET active = $2 WHERE id = $1",
                &[&id.0, &active],
            )
            .await?;
        if n == 0 {
            return Err(WebhookError::SubscriptionNotFound(id));
        }
        Ok(())
    }

    async fn delete(&self, id: SubscriptionId) -> StoreResult<()> {
        self.client
            .execute("DELETE FROM webhook_subscriptions WHERE id = $1", &[&id.0])
            .await?;
        Ok(())
    }

    async fn record_dispatch(&self, id: SubscriptionId, count: u64) -> StoreResult<()> {
        let n = self
            .client
            .execute(
                "UPDATE webhook_subscriptions \
                 SET total_deliveries = total_deliveries + $2 WHERE id = $1",
                &[&id.0, &(count as i64)],
            )
            .await?;
        if n == 0 {
            return Err(WebhookError::SubscriptionNotFound(id));
        }
        Ok(())
    }

    async fn record_attempt(&self, id: SubscriptionId, at: DateTime<Utc>) -> StoreResult<()> {
        let n = self
            .client
            .execute(
                "UPDATE webhook_subscriptions SET last_delivery_at = $2 WHERE id = $1",
                &[&id.0, &at],
            )
            .await?;
        if n == 0 {
            return Err(WebhookError::SubscriptionNotFound(id));
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        id: SubscriptionId,
        success: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let statement = if success {
            "UPDATE webhook_subscriptions \
             SET successful_deliveries = successful_deliveries + 1, \
                 last_success_at = $2, last_delivery_at = $2 \
             WHERE id = $1"
        } else {
            "UPDATE webhook_subscriptions \
             SET failed_deliveries = failed_deliveries + 1, last_delivery_at = $2 \
             WHERE id = $1"
        };
        let n = self.client.execute(statement, &[&id.0, &at]).await?;
        if n == 0 {
            return Err(WebhookError::SubscriptionNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryStore for PostgresStore {
    async fn create(&self, delivery: &Delivery) -> StoreResult<()> {
        self.client
            .execute(
                "INSERT INTO webhook_deliveries \
                 (id, subscription_id, event_type, payload, status, attempt_count, \
                  next_retry_at, lease_expires_at, response_code, response_body, latency_ms, \
                  error_message, created_at, updated_at, delivered_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
                &[
                    &delivery.id.0,
                    &delivery.subscription_id.0,
                    &delivery.event_type.as_str(),
                    &delivery.payload,
                    &delivery.status.as_str(),
                    &(delivery.attempt_count as i32),
                    &delivery.next_retry_at,
                    &delivery.lease_expires_at,
                    &delivery.response_code.map(|c| c as i32),
                    &delivery.response_body,
                    &delivery.latency_ms.map(|l| l as i64),
                    &delivery.error_message,
                    &delivery.created_at,
                    &delivery.updated_at,
                    &delivery.delivered_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: DeliveryId) -> StoreResult<Option<Delivery>> {
        let row = self
            .client
            .query_opt("SELECT * FROM webhook_deliveries WHERE id = $1", &[&id.0])
            .await?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    async fn mark_sending(
        &self,
        id: DeliveryId,
        lease_expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let n = self
            .client
            .execute(
                "UPDATE webhook_deliveries \
                 SET status = 'sending', lease_expires_at = $2, updated_at = now() \
                 WHERE id = $1 AND status IN ('pending', 'retrying')",
                &[&id.0, &lease_expires_at],
            )
            .await?;
        Ok(n > 0)
    }

    async fn mark_success(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        response: ResponseMeta,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let n = self
            .client
            .execute(
                "UPDATE webhook_deliveries \
                 SET status = 'success', attempt_count = $2, next_retry_at = NULL, \
                     lease_expires_at = NULL, response_code = $3, response_body = $4, \
                     latency_ms = $5, error_message = NULL, delivered_at = $6, updated_at = $6 \
                 WHERE id = $1 AND status NOT IN ('success', 'failed')",
                &[
                    &id.0,
                    &(attempt_count as i32),
                    &response.code.map(|c| c as i32),
                    &response.body,
                    &response.latency_ms.map(|l| l as i64),
                    &at,
                ],
            )
            .await?;
        Ok(n > 0)
    }

    async fn mark_retrying(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        response: ResponseMeta,
    ) -> StoreResult<bool> {
        let n = self
            .client
            .execute(
                "UPDATE webhook_deliveries \
                 SET status = 'retrying', attempt_count = $2, next_retry_at = $3, \
                     lease_expires_at = NULL, response_code = $4, response_body = $5, \
                     latency_ms = $6, error_message = $7, updated_at = now() \
                 WHERE id = $1 AND status NOT IN ('success', 'failed')",
                &[
                    &id.0,
                    &(attempt_count as i32),
                    &next_retry_at,
                    &response.code.map(|c| c as i32),
                    &response.body,
                    &response.latency_ms.map(|l| l as i64),
                    &error,
                ],
            )
            .await?;
        Ok(n > 0)
    }

    async fn mark_failed(
        &self,
        id: DeliveryId,
        attempt_count: u32,
        error: &str,
        response: ResponseMeta,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let n = self
            .client
            .execute(
                "UPDATE webhook_deliveries \
                 SET status = 'failed', attempt_count = $2, next_retry_at = NULL, \
                     lease_expires_at = NULL, response_code = $3, response_body = $4, \
                     latency_ms = $5, error_message = $6, updated_at = $7 \
                 WHERE id = $1 AND status NOT IN ('success', 'failed')",
                &[
                    &id.0,
                    &(attempt_count as i32),
                    &response.code.map(|c| c as i32),
                    &response.body,
                    &response.latency_ms.map(|l| l as i64),
                    &error,
                    &at,
                ],
            )
            .await?;
        Ok(n > 0)
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> StoreResult<Vec<DeliveryId>> {
        let rows = self
            .client
            .query(
                "SELECT id FROM webhook_deliveries \
                 WHERE status = 'retrying' AND next_retry_at <= $1",
                &[&now],
            )
            .await?;
        Ok(rows.iter().map(|r| DeliveryId(r.get("id"))).collect())
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> StoreResult<Vec<DeliveryId>> {
        let rows = self
            .client
            .query(
                "SELECT id FROM webhook_deliveries \
                 WHERE status = 'sending' AND lease_expires_at <= $1",
                &[&now],
            )
            .await?;
        Ok(rows.iter().map(|r| DeliveryId(r.get("id"))).collect())
    }

    async fn stale_pending(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DeliveryId>> {
        let rows = self
            .client
            .query(
                "SELECT id FROM webhook_deliveries \
                 WHERE status = 'pending' AND created_at <= $1",
                &[&cutoff],
            )
            .await?;
        Ok(rows.iter().map(|r| DeliveryId(r.get("id"))).collect())
    }

    async fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let n = self
            .client
            .execute(
                "DELETE FROM webhook_deliveries \
                 WHERE status = 'success' AND delivered_at < $1",
                &[&cutoff],
            )
            .await?;
        Ok(n)
    }

    async fn delete_for_subscription(&self, id: SubscriptionId) -> StoreResult<u64> {
        let n = self
            .client
            .execute(
                "DELETE FROM webhook_deliveries WHERE subscription_id = $1",
                &[&id.0],
            )
            .await?;
        Ok(n)
    }

    async fn list_for_subscription(&self, id: SubscriptionId) -> StoreResult<Vec<Delivery>> {
        let rows = self
            .client
            .query(
                "SELECT * FROM webhook_deliveries \
                 WHERE subscription_id = $1 ORDER BY created_at",
                &[&id.0],
            )
            .await?;
        rows.iter().map(delivery_from_row).collect()
    }
}
