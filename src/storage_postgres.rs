use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, GenericClient, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::storage::{DeliveryUpdate, Storage};
use crate::types::{
    ApiKey, ApiKeyId, Delivery, DeliveryId, DeliveryStatus, Endpoint, EndpointId, EndpointStatus,
    Event, EventId, HeaderMap, HttpMethod, OwnerId, Payload, RetryConfig,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS webhook_api_keys (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        key_hash TEXT NOT NULL UNIQUE,
        key_prefix TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        last_used_at TIMESTAMPTZ,
        expires_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS webhook_endpoints (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        url TEXT NOT NULL,
        method TEXT NOT NULL DEFAULT 'POST',
        headers JSONB NOT NULL DEFAULT '{}',
        secret TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        timeout_ms BIGINT,
        max_attempts INTEGER,
        backoff_ms BIGINT
    )",
    "CREATE TABLE IF NOT EXISTS webhook_events (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        source TEXT,
        headers JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL,
        processed BOOLEAN NOT NULL DEFAULT FALSE
    )",
    "CREATE TABLE IF NOT EXISTS webhook_deliveries (
        id TEXT PRIMARY KEY,
        endpoint_id TEXT NOT NULL,
        event_id TEXT,
        owner_id TEXT NOT NULL,
        status TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        request_payload JSONB NOT NULL,
        request_headers JSONB NOT NULL DEFAULT '{}',
        response_status INTEGER,
        response_body TEXT,
        response_headers JSONB,
        response_time_ms BIGINT,
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        next_retry_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        claimed_at TIMESTAMPTZ,
        claim_token TEXT,
        UNIQUE (endpoint_id, event_id),
        CHECK (attempt_count <= max_attempts)
    )",
    "CREATE INDEX IF NOT EXISTS webhook_deliveries_due_idx
        ON webhook_deliveries (status, created_at)",
];

const DELIVERY_COLUMNS: &str = "id, endpoint_id, event_id, owner_id, status, attempt_count, max_attempts,
    request_payload, request_headers, response_status, response_body, response_headers,
    response_time_ms, error_message, created_at, next_retry_at, completed_at, claimed_at, claim_token";

// $1 = now, $2 = stale_before
const DUE_PREDICATE: &str = "((status IN ('pending', 'retrying') AND (next_retry_at IS NULL OR next_retry_at <= $1))
    OR (status = 'in_progress' AND (claimed_at IS NULL OR claimed_at < $2)))";

/// Postgres-backed storage.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of processes can run
/// cycles against the same tables.
pub struct PostgresStorage {
    client: Mutex<Client>,
}

impl PostgresStorage {
    /// Wrap a connected client and make sure the tables exist.
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            client.execute(*statement, &[]).await?;
        }
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Connect with `tokio-postgres` and drive the connection on a background
    /// task.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(database_url, tokio_postgres::NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(error = %err, "postgres connection closed");
            }
        });
        Self::new(client).await
    }
}

fn conflict_or_unavailable(err: tokio_postgres::Error) -> StoreError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) || err.code() == Some(&SqlState::CHECK_VIOLATION) {
        StoreError::Conflict(err.to_string())
    } else {
        StoreError::from(err)
    }
}

fn headers_to_json(headers: &HeaderMap) -> Result<serde_json::Value, StoreError> {
    Ok(serde_json::to_value(headers)?)
}

fn headers_from_json(value: serde_json::Value) -> Result<HeaderMap, StoreError> {
    Ok(serde_json::from_value::<BTreeMap<String, String>>(value)?)
}

fn api_key_from_row(row: &Row) -> Result<ApiKey, StoreError> {
    Ok(ApiKey {
        id: ApiKeyId(row.try_get("id")?),
        owner_id: OwnerId(row.try_get("owner_id")?),
        key_hash: row.try_get("key_hash")?,
        key_prefix: row.try_get("key_prefix")?,
        is_active: row.try_get("is_active")?,
        last_used_at: row.try_get("last_used_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn endpoint_from_row(row: &Row) -> Result<Endpoint, StoreError> {
    let method: String = row.try_get("method")?;
    let status: String = row.try_get("status")?;
    let timeout_ms: Option<i64> = row.try_get("timeout_ms")?;
    let max_attempts: Option<i32> = row.try_get("max_attempts")?;
    let backoff_ms: Option<i64> = row.try_get("backoff_ms")?;

    Ok(Endpoint {
        id: EndpointId(row.try_get("id")?),
        owner_id: OwnerId(row.try_get("owner_id")?),
        url: row.try_get("url")?,
        method: HttpMethod::parse(&method)
            .ok_or_else(|| StoreError::Conflict(format!("unknown method {}", method)))?,
        headers: headers_from_json(row.try_get("headers")?)?,
        secret: row.try_get("secret")?,
        status: EndpointStatus::parse(&status)
            .ok_or_else(|| StoreError::Conflict(format!("unknown endpoint status {}", status)))?,
        timeout_ms: timeout_ms.map(|v| v.max(0) as u64),
        retry_config: RetryConfig {
            max_attempts: max_attempts.map(|v| v.max(0) as u32),
            backoff_ms: backoff_ms.map(|v| v.max(0) as u64),
        },
    })
}

fn event_from_row(row: &Row) -> Result<Event, StoreError> {
    Ok(Event {
        id: EventId(row.try_get("id")?),
        owner_id: OwnerId(row.try_get("owner_id")?),
        event_type: row.try_get("event_type")?,
        payload: Payload(row.try_get("payload")?),
        source: row.try_get("source")?,
        headers: headers_from_json(row.try_get("headers")?)?,
        created_at: row.try_get("created_at")?,
        processed: row.try_get("processed")?,
    })
}

fn delivery_from_row(row: &Row) -> Result<Delivery, StoreError> {
    let status: String = row.try_get("status")?;
    let attempt_count: i32 = row.try_get("attempt_count")?;
    let max_attempts: i32 = row.try_get("max_attempts")?;
    let response_status: Option<i32> = row.try_get("response_status")?;
    let response_headers: Option<serde_json::Value> = row.try_get("response_headers")?;
    let response_time_ms: Option<i64> = row.try_get("response_time_ms")?;
    let event_id: Option<String> = row.try_get("event_id")?;
    let claim_token: Option<String> = row.try_get("claim_token")?;

    Ok(Delivery {
        id: DeliveryId(row.try_get("id")?),
        endpoint_id: EndpointId(row.try_get("endpoint_id")?),
        event_id: event_id.map(EventId),
        owner_id: OwnerId(row.try_get("owner_id")?),
        status: DeliveryStatus::parse(&status)
            .ok_or_else(|| StoreError::Conflict(format!("unknown delivery status {}", status)))?,
        attempt_count: attempt_count.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        request_payload: Payload(row.try_get("request_payload")?),
        request_headers: headers_from_json(row.try_get("request_headers")?)?,
        response_status: response_status.and_then(|s| u16::try_from(s).ok()),
        response_body: row.try_get("response_body")?,
        response_headers: response_headers.map(headers_from_json).transpose()?,
        response_time_ms: response_time_ms.map(|v| v.max(0) as u64),
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        next_retry_at: row.try_get("next_retry_at")?,
        completed_at: row.try_get("completed_at")?,
        claimed_at: row.try_get("claimed_at")?,
        claim_token: claim_token.and_then(|t| Uuid::parse_str(&t).ok()),
    })
}

async fn select_delivery_for_update<C: GenericClient>(
    client: &C,
    id: &DeliveryId,
) -> Result<Delivery, StoreError> {
    let row = client
        .query_opt(
            &*format!("SELECT {} FROM webhook_deliveries WHERE id = $1 FOR UPDATE", DELIVERY_COLUMNS),
            &[&id.0],
        )
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("delivery {}", id)))?;
    delivery_from_row(&row)
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn put_api_key(&self, key: ApiKey) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO webhook_api_keys (id, owner_id, key_hash, key_prefix, is_active, last_used_at, expires_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO UPDATE SET
                    owner_id = EXCLUDED.owner_id, key_hash = EXCLUDED.key_hash,
                    key_prefix = EXCLUDED.key_prefix, is_active = EXCLUDED.is_active,
                    last_used_at = EXCLUDED.last_used_at, expires_at = EXCLUDED.expires_at",
                &[
                    &key.id.0,
                    &key.owner_id.0,
                    &key.key_hash,
                    &key.key_prefix,
                    &key.is_active,
                    &key.last_used_at,
                    &key.expires_at,
                ],
            )
            .await
            .map_err(conflict_or_unavailable)?;
        Ok(())
    }

    async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT * FROM webhook_api_keys WHERE key_hash = $1", &[&key_hash])
            .await?;
        row.as_ref().map(api_key_from_row).transpose()
    }

    async fn touch_api_key(&self, id: &ApiKeyId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        let updated = client
            .execute("UPDATE webhook_api_keys SET last_used_at = $2 WHERE id = $1", &[&id.0, &at])
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("api key {}", id)));
        }
        Ok(())
    }

    async fn put_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError> {
        let headers = headers_to_json(&endpoint.headers)?;
        let timeout_ms = endpoint.timeout_ms.map(|v| v as i64);
        let max_attempts = endpoint.retry_config.max_attempts.map(|v| v as i32);
        let backoff_ms = endpoint.retry_config.backoff_ms.map(|v| v as i64);

        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO webhook_endpoints
                    (id, owner_id, url, method, headers, secret, status, timeout_ms, max_attempts, backoff_ms)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (id) DO UPDATE SET
                    owner_id = EXCLUDED.owner_id, url = EXCLUDED.url, method = EXCLUDED.method,
                    headers = EXCLUDED.headers, secret = EXCLUDED.secret, status = EXCLUDED.status,
                    timeout_ms = EXCLUDED.timeout_ms, max_attempts = EXCLUDED.max_attempts,
                    backoff_ms = EXCLUDED.backoff_ms",
                &[
                    &endpoint.id.0,
                    &endpoint.owner_id.0,
                    &endpoint.url,
                    &endpoint.method.as_str(),
                    &headers,
                    &endpoint.secret,
                    &endpoint.status.as_str(),
                    &timeout_ms,
                    &max_attempts,
                    &backoff_ms,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_endpoint(&self, id: &EndpointId) -> Result<Option<Endpoint>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT * FROM webhook_endpoints WHERE id = $1", &[&id.0])
            .await?;
        row.as_ref().map(endpoint_from_row).transpose()
    }

    async fn list_active_endpoints(&self, owner: &OwnerId) -> Result<Vec<Endpoint>, StoreError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT * FROM webhook_endpoints WHERE owner_id = $1 AND status = 'active' ORDER BY id",
                &[&owner.0],
            )
            .await?;
        rows.iter().map(endpoint_from_row).collect()
    }

    async fn insert_event(&self, event: Event, deliveries: Vec<Delivery>) -> Result<(), StoreError> {
        let event_headers = headers_to_json(&event.headers)?;

        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        tx.execute(
            "INSERT INTO webhook_events (id, owner_id, event_type, payload, source, headers, created_at, processed)
             VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE)",
            &[
                &event.id.0,
                &event.owner_id.0,
                &event.event_type,
                &event.payload.0,
                &event.source,
                &event_headers,
                &event.created_at,
            ],
        )
        .await
        .map_err(conflict_or_unavailable)?;

        for delivery in &deliveries {
            let request_headers = headers_to_json(&delivery.request_headers)?;
            let event_id = delivery.event_id.as_ref().map(|id| id.0.clone());
            tx.execute(
                "INSERT INTO webhook_deliveries
                    (id, endpoint_id, event_id, owner_id, status, attempt_count, max_attempts,
                     request_payload, request_headers, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &delivery.id.0,
                    &delivery.endpoint_id.0,
                    &event_id,
                    &delivery.owner_id.0,
                    &delivery.status.as_str(),
                    &(delivery.attempt_count as i32),
                    &(delivery.max_attempts as i32),
                    &delivery.request_payload.0,
                    &request_headers,
                    &delivery.created_at,
                ],
            )
            .await
            .map_err(conflict_or_unavailable)?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_event(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT * FROM webhook_events WHERE id = $1", &[&id.0])
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &*format!("SELECT {} FROM webhook_deliveries WHERE id = $1", DELIVERY_COLUMNS),
                &[&id.0],
            )
            .await?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    async fn list_deliveries_for_event(&self, id: &EventId) -> Result<Vec<Delivery>, StoreError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM webhook_deliveries WHERE event_id = $1 ORDER BY endpoint_id",
                    DELIVERY_COLUMNS
                ),
                &[&id.0],
            )
            .await?;
        rows.iter().map(delivery_from_row).collect()
    }

    async fn list_deliveries(&self, owner: &OwnerId, limit: usize) -> Result<Vec<Delivery>, StoreError> {
        let limit = limit as i64;
        let client = self.client.lock().await;
        let rows = client
            .query(
                &*format!(
                    "SELECT {} FROM webhook_deliveries WHERE owner_id = $1 ORDER BY created_at DESC LIMIT $2",
                    DELIVERY_COLUMNS
                ),
                &[&owner.0, &limit],
            )
            .await?;
        rows.iter().map(delivery_from_row).collect()
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Delivery>, StoreError> {
        let limit = limit as i64;
        let client = self.client.lock().await;
        let rows = client
            .query(
                &*format!(
                    "UPDATE webhook_deliveries
                     SET status = 'in_progress', claimed_at = $1, claim_token = gen_random_uuid()::text
                     WHERE id IN (
                        SELECT id FROM webhook_deliveries
                        WHERE {}
                        ORDER BY created_at, id
                        LIMIT $3
                        FOR UPDATE SKIP LOCKED
                     )
                     RETURNING {}",
                    DUE_PREDICATE, DELIVERY_COLUMNS
                ),
                &[&now, &stale_before, &limit],
            )
            .await?;

        let mut claimed = rows.iter().map(delivery_from_row).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(claimed)
    }

    async fn claim(
        &self,
        id: &DeliveryId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Delivery>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &*format!(
                    "UPDATE webhook_deliveries
                     SET status = 'in_progress', claimed_at = $1, claim_token = gen_random_uuid()::text
                     WHERE id = $3 AND {}
                     RETURNING {}",
                    DUE_PREDICATE, DELIVERY_COLUMNS
                ),
                &[&now, &stale_before, &id.0],
            )
            .await?;

        match row {
            Some(row) => Ok(Some(delivery_from_row(&row)?)),
            None => {
                let exists = client
                    .query_opt("SELECT 1 FROM webhook_deliveries WHERE id = $1", &[&id.0])
                    .await?
                    .is_some();
                if exists {
                    Ok(None)
                } else {
                    Err(StoreError::NotFound(format!("delivery {}", id)))
                }
            }
        }
    }

    async fn complete(&self, update: &DeliveryUpdate) -> Result<Delivery, StoreError> {
        let response_headers = update.response_headers.as_ref().map(headers_to_json).transpose()?;
        let response_status = update.response_status.map(i32::from);
        let response_time_ms = update.response_time_ms.map(|v| v as i64);
        let token = update.claim_token.to_string();

        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let current = select_delivery_for_update(&tx, &update.id).await?;
        if current.status != DeliveryStatus::InProgress || current.claim_token != Some(update.claim_token) {
            return Err(StoreError::ClaimLost(update.id.clone()));
        }
        update.validate(current.max_attempts)?;

        let row = tx
            .query_one(
                &*format!(
                    "UPDATE webhook_deliveries SET
                        status = $3, attempt_count = $4, response_status = $5, response_body = $6,
                        response_headers = $7, response_time_ms = $8, error_message = $9,
                        next_retry_at = $10, completed_at = $11, claimed_at = NULL, claim_token = NULL
                     WHERE id = $1 AND status = 'in_progress' AND claim_token = $2
                     RETURNING {}",
                    DELIVERY_COLUMNS
                ),
                &[
                    &update.id.0,
                    &token,
                    &update.status.as_str(),
                    &(update.attempt_count as i32),
                    &response_status,
                    &update.response_body,
                    &response_headers,
                    &response_time_ms,
                    &update.error_message,
                    &update.next_retry_at,
                    &update.completed_at,
                ],
            )
            .await
            .map_err(conflict_or_unavailable)?;
        let committed = delivery_from_row(&row)?;

        tx.commit().await?;
        Ok(committed)
    }

    async fn refresh_claim(
        &self,
        id: &DeliveryId,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let current = select_delivery_for_update(&tx, id).await?;
        if current.status != DeliveryStatus::InProgress || current.claim_token != Some(claim_token) {
            return Err(StoreError::ClaimLost(id.clone()));
        }

        tx.execute(
            "UPDATE webhook_deliveries SET claimed_at = $2 WHERE id = $1",
            &[&id.0, &now],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn release(&self, id: &DeliveryId, claim_token: Uuid) -> Result<(), StoreError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let current = select_delivery_for_update(&tx, id).await?;
        if current.status != DeliveryStatus::InProgress || current.claim_token != Some(claim_token) {
            return Err(StoreError::ClaimLost(id.clone()));
        }

        tx.execute(
            "UPDATE webhook_deliveries SET status = $2, claimed_at = NULL, claim_token = NULL WHERE id = $1",
            &[&id.0, &current.unclaimed_status().as_str()],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn retry_now(&self, id: &DeliveryId, now: DateTime<Utc>) -> Result<Delivery, StoreError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let current = select_delivery_for_update(&tx, id).await?;
        if !matches!(current.status, DeliveryStatus::Failed | DeliveryStatus::Retrying) {
            return Err(StoreError::Conflict(format!(
                "delivery {} is {} and cannot be retried",
                id, current.status
            )));
        }

        let row = tx
            .query_one(
                &*format!(
                    "UPDATE webhook_deliveries
                     SET status = 'retrying', next_retry_at = $2, completed_at = NULL
                     WHERE id = $1
                     RETURNING {}",
                    DELIVERY_COLUMNS
                ),
                &[&id.0, &now],
            )
            .await?;
        let updated = delivery_from_row(&row)?;

        tx.commit().await?;
        Ok(updated)
    }
}
