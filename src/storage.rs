use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    ApiKey, ApiKeyId, Delivery, DeliveryId, DeliveryStatus, Endpoint, EndpointId, Event, EventId,
    HeaderMap, OwnerId,
};

/// Outcome of one worker pass over a claimed row.
///
/// Committed as a unit: either every field lands, including the attempt
/// increment, or the row is left untouched.
#[derive(Debug, Clone)]
pub struct DeliveryUpdate {
    pub id: DeliveryId,
    pub claim_token: Uuid,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub response_headers: Option<HeaderMap>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeliveryUpdate {
    /// Reject updates that would break the row invariants.
    pub fn validate(&self, max_attempts: u32) -> Result<(), StoreError> {
        if self.attempt_count > max_attempts {
            return Err(StoreError::Conflict(format!(
                "attempt_count {} exceeds max_attempts {} for delivery {}",
                self.attempt_count, max_attempts, self.id
            )));
        }
        let consistent = match self.status {
            DeliveryStatus::Retrying => self.next_retry_at.is_some() && self.completed_at.is_none(),
            DeliveryStatus::Success | DeliveryStatus::Failed => {
                self.next_retry_at.is_none() && self.completed_at.is_some()
            }
            DeliveryStatus::Pending | DeliveryStatus::InProgress => false,
        };
        if !consistent {
            return Err(StoreError::Conflict(format!(
                "inconsistent {} update for delivery {}",
                self.status, self.id
            )));
        }
        Ok(())
    }

    fn apply_to(&self, row: &mut Delivery) {
        row.status = self.status;
        row.attempt_count = self.attempt_count;
        row.response_status = self.response_status;
        row.response_body = self.response_body.clone();
        row.response_headers = self.response_headers.clone();
        row.response_time_ms = self.response_time_ms;
        row.error_message = self.error_message.clone();
        row.next_retry_at = self.next_retry_at;
        row.completed_at = self.completed_at;
        row.claimed_at = None;
        row.claim_token = None;
    }
}

/// Persistence seam for keys, endpoints, events and deliveries.
///
/// Every method is atomic on its own. Claiming is the only way a row enters
/// `InProgress`, and only the holder of the claim token may complete it.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn put_api_key(&self, key: ApiKey) -> Result<(), StoreError>;
    async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError>;
    async fn touch_api_key(&self, id: &ApiKeyId, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn put_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError>;
    async fn get_endpoint(&self, id: &EndpointId) -> Result<Option<Endpoint>, StoreError>;
    async fn list_active_endpoints(&self, owner: &OwnerId) -> Result<Vec<Endpoint>, StoreError>;

    /// Persist an event together with its fan-out rows, all or nothing.
    async fn insert_event(&self, event: Event, deliveries: Vec<Delivery>) -> Result<(), StoreError>;
    async fn get_event(&self, id: &EventId) -> Result<Option<Event>, StoreError>;

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>, StoreError>;
    async fn list_deliveries_for_event(&self, id: &EventId) -> Result<Vec<Delivery>, StoreError>;
    /// Most recent deliveries of an owner, newest first.
    async fn list_deliveries(&self, owner: &OwnerId, limit: usize) -> Result<Vec<Delivery>, StoreError>;

    /// Claim up to `limit` due rows, oldest first.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Delivery>, StoreError>;

    /// Claim a single row if it is due. `None` means someone else holds it
    /// or it is not due.
    async fn claim(
        &self,
        id: &DeliveryId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Delivery>, StoreError>;

    /// Re-stamp a held claim at `now`, just before its request goes out.
    /// Fails with `ClaimLost` if the row was reclaimed in the meantime.
    async fn refresh_claim(
        &self,
        id: &DeliveryId,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Commit a worker outcome. Fails with `ClaimLost` if the claim token no
    /// longer matches.
    async fn complete(&self, update: &DeliveryUpdate) -> Result<Delivery, StoreError>;

    /// Give a claimed row back without recording an attempt.
    async fn release(&self, id: &DeliveryId, claim_token: Uuid) -> Result<(), StoreError>;

    /// Manual "retry now": a failed or retrying row becomes due immediately.
    async fn retry_now(&self, id: &DeliveryId, now: DateTime<Utc>) -> Result<Delivery, StoreError>;
}

#[derive(Default)]
struct Tables {
    api_keys: HashMap<ApiKeyId, ApiKey>,
    endpoints: HashMap<EndpointId, Endpoint>,
    events: HashMap<EventId, Event>,
    deliveries: HashMap<DeliveryId, Delivery>,
    pairs: HashSet<(EndpointId, EventId)>,
}

impl Tables {
    fn claim_row(&mut self, id: &DeliveryId, now: DateTime<Utc>) -> Option<Delivery> {
        let row = self.deliveries.get_mut(id)?;
        row.status = DeliveryStatus::InProgress;
        row.claimed_at = Some(now);
        row.claim_token = Some(Uuid::new_v4());
        Some(row.clone())
    }
}

/// In-memory storage for tests and single-process deployments.
///
/// One lock guards all tables so multi-row operations stay atomic.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn event_count(&self) -> usize {
        self.tables.lock().await.events.len()
    }

    pub async fn delivery_count(&self) -> usize {
        self.tables.lock().await.deliveries.len()
    }

    pub async fn all_deliveries(&self) -> Vec<Delivery> {
        let mut rows: Vec<Delivery> = self.tables.lock().await.deliveries.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rows
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put_api_key(&self, key: ApiKey) -> Result<(), StoreError> {
        self.tables.lock().await.api_keys.insert(key.id.clone(), key);
        Ok(())
    }

    async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.api_keys.values().find(|k| k.key_hash == key_hash).cloned())
    }

    async fn touch_api_key(&self, id: &ApiKeyId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let key = tables
            .api_keys
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("api key {}", id)))?;
        key.last_used_at = Some(at);
        Ok(())
    }

    async fn put_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError> {
        self.tables.lock().await.endpoints.insert(endpoint.id.clone(), endpoint);
        Ok(())
    }

    async fn get_endpoint(&self, id: &EndpointId) -> Result<Option<Endpoint>, StoreError> {
        Ok(self.tables.lock().await.endpoints.get(id).cloned())
    }

    async fn list_active_endpoints(&self, owner: &OwnerId) -> Result<Vec<Endpoint>, StoreError> {
        let tables = self.tables.lock().await;
        let mut endpoints: Vec<Endpoint> = tables
            .endpoints
            .values()
            .filter(|e| &e.owner_id == owner && e.is_active())
            .cloned()
            .collect();
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(endpoints)
    }

    async fn insert_event(&self, mut event: Event, deliveries: Vec<Delivery>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;

        if tables.events.contains_key(&event.id) {
            return Err(StoreError::Conflict(format!("event {} already exists", event.id)));
        }
        let mut seen = HashSet::new();
        for delivery in &deliveries {
            let pair = (delivery.endpoint_id.clone(), event.id.clone());
            if tables.pairs.contains(&pair) || !seen.insert(pair) {
                return Err(StoreError::Conflict(format!(
                    "duplicate delivery for endpoint {} and event {}",
                    delivery.endpoint_id, event.id
                )));
            }
        }

        event.processed = true;
        for delivery in deliveries {
            tables.pairs.insert((delivery.endpoint_id.clone(), event.id.clone()));
            tables.deliveries.insert(delivery.id.clone(), delivery);
        }
        tables.events.insert(event.id.clone(), event);
        Ok(())
    }

    async fn get_event(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        Ok(self.tables.lock().await.events.get(id).cloned())
    }

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>, StoreError> {
        Ok(self.tables.lock().await.deliveries.get(id).cloned())
    }

    async fn list_deliveries_for_event(&self, id: &EventId) -> Result<Vec<Delivery>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<Delivery> = tables
            .deliveries
            .values()
            .filter(|d| d.event_id.as_ref() == Some(id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        Ok(rows)
    }

    async fn list_deliveries(&self, owner: &OwnerId, limit: usize) -> Result<Vec<Delivery>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<Delivery> = tables
            .deliveries
            .values()
            .filter(|d| &d.owner_id == owner)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Delivery>, StoreError> {
        let mut tables = self.tables.lock().await;

        let mut due: Vec<(DateTime<Utc>, DeliveryId)> = tables
            .deliveries
            .values()
            .filter(|d| d.is_due(now, stale_before))
            .map(|d| (d.created_at, d.id.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        Ok(due
            .into_iter()
            .filter_map(|(_, id)| tables.claim_row(&id, now))
            .collect())
    }

    async fn claim(
        &self,
        id: &DeliveryId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Delivery>, StoreError> {
        let mut tables = self.tables.lock().await;
        let due = match tables.deliveries.get(id) {
            Some(row) => row.is_due(now, stale_before),
            None => return Err(StoreError::NotFound(format!("delivery {}", id))),
        };
        if !due {
            return Ok(None);
        }
        Ok(tables.claim_row(id, now))
    }

    async fn refresh_claim(
        &self,
        id: &DeliveryId,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .deliveries
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("delivery {}", id)))?;

        if row.status != DeliveryStatus::InProgress || row.claim_token != Some(claim_token) {
            return Err(StoreError::ClaimLost(id.clone()));
        }
        row.claimed_at = Some(now);
        Ok(())
    }

    async fn complete(&self, update: &DeliveryUpdate) -> Result<Delivery, StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .deliveries
            .get_mut(&update.id)
            .ok_or_else(|| StoreError::NotFound(format!("delivery {}", update.id)))?;

        if row.status != DeliveryStatus::InProgress || row.claim_token != Some(update.claim_token) {
            return Err(StoreError::ClaimLost(update.id.clone()));
        }
        update.validate(row.max_attempts)?;
        update.apply_to(row);
        Ok(row.clone())
    }

    async fn release(&self, id: &DeliveryId, claim_token: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .deliveries
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("delivery {}", id)))?;

        if row.status != DeliveryStatus::InProgress || row.claim_token != Some(claim_token) {
            return Err(StoreError::ClaimLost(id.clone()));
        }
        row.status = row.unclaimed_status();
        row.claimed_at = None;
        row.claim_token = None;
        Ok(())
    }

    async fn retry_now(&self, id: &DeliveryId, now: DateTime<Utc>) -> Result<Delivery, StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .deliveries
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("delivery {}", id)))?;

        match row.status {
            DeliveryStatus::Failed | DeliveryStatus::Retrying => {
                row.status = DeliveryStatus::Retrying;
                row.next_retry_at = Some(now);
                row.completed_at = None;
                Ok(row.clone())
            }
            other => Err(StoreError::Conflict(format!(
                "delivery {} is {} and cannot be retried",
                id, other
            ))),
        }
    }
}
