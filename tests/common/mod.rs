#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use webhook_pipeline::{
    ApiKey, ApiKeyId, Delivery, DeliveryId, DeliveryStatus, DeliveryUpdate, Endpoint, EndpointId,
    Event, EventId, HeaderMap, InMemoryStorage, IngestRequest, Ingestor, OutboundRequest, OwnerId,
    Payload, PipelineConfig, Scheduler, Storage, StoreError, Transport, TransportError,
    TransportResponse,
};

pub const OWNER: &str = "acme";
pub const API_KEY: &str = "whk_test_0123456789";

/// What a scripted endpoint does on each call.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    Fail(TransportError),
    /// Never answers; only the worker's timeout ends the call.
    Hang,
}

/// In-process transport with per-URL scripts. Once a script runs out, the
/// last reply repeats; unknown URLs answer 200.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Vec<Reply>>>,
    calls: Mutex<Vec<OutboundRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, replies: Vec<Reply>) {
        self.scripts.lock().unwrap().insert(url.to_string(), replies);
    }

    /// Sleep this long before every reply.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<OutboundRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.url == url).count()
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(url) {
            Some(replies) if replies.len() > 1 => replies.remove(0),
            Some(replies) => replies.first().cloned().unwrap_or(Reply::Status(200)),
            None => Reply::Status(200),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        let reply = self.next_reply(&request.url);
        self.calls.lock().unwrap().push(request);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match reply {
            Reply::Status(status) => Ok(TransportResponse {
                status,
                headers: HeaderMap::from([("content-type".to_string(), "text/plain".to_string())]),
                body: format!("status {}", status).into_bytes(),
            }),
            Reply::Fail(err) => Err(err),
            Reply::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Wraps [`InMemoryStorage`] and fails selected operations on demand.
pub struct FlakyStorage {
    pub inner: Arc<InMemoryStorage>,
    pub fail_insert: AtomicBool,
    pub fail_complete: AtomicBool,
    pub fail_claim: AtomicBool,
    pub completes: AtomicUsize,
}

impl FlakyStorage {
    pub fn new(inner: Arc<InMemoryStorage>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_insert: AtomicBool::new(false),
            fail_complete: AtomicBool::new(false),
            fail_claim: AtomicBool::new(false),
            completes: AtomicUsize::new(0),
        })
    }
}

fn unavailable() -> StoreError {
    StoreError::Unavailable("injected failure".to_string())
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn put_api_key(&self, key: ApiKey) -> Result<(), StoreError> {
        self.inner.put_api_key(key).await
    }

    async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        self.inner.find_api_key(key_hash).await
    }

    async fn touch_api_key(&self, id: &ApiKeyId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.touch_api_key(id, at).await
    }

    async fn put_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError> {
        self.inner.put_endpoint(endpoint).await
    }

    async fn get_endpoint(&self, id: &EndpointId) -> Result<Option<Endpoint>, StoreError> {
        self.inner.get_endpoint(id).await
    }

    async fn list_active_endpoints(&self, owner: &OwnerId) -> Result<Vec<Endpoint>, StoreError> {
        self.inner.list_active_endpoints(owner).await
    }

    async fn insert_event(&self, event: Event, deliveries: Vec<Delivery>) -> Result<(), StoreError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.insert_event(event, deliveries).await
    }

    async fn get_event(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        self.inner.get_event(id).await
    }

    async fn get_delivery(&self, id: &DeliveryId) -> Result<Option<Delivery>, StoreError> {
        self.inner.get_delivery(id).await
    }

    async fn list_deliveries_for_event(&self, id: &EventId) -> Result<Vec<Delivery>, StoreError> {
        self.inner.list_deliveries_for_event(id).await
    }

    async fn list_deliveries(&self, owner: &OwnerId, limit: usize) -> Result<Vec<Delivery>, StoreError> {
        self.inner.list_deliveries(owner, limit).await
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Delivery>, StoreError> {
        if self.fail_claim.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.claim_due(now, limit, stale_before).await
    }

    async fn claim(
        &self,
        id: &DeliveryId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Delivery>, StoreError> {
        self.inner.claim(id, now, stale_before).await
    }

    async fn refresh_claim(
        &self,
        id: &DeliveryId,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.refresh_claim(id, claim_token, now).await
    }

    async fn complete(&self, update: &DeliveryUpdate) -> Result<Delivery, StoreError> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        if self.fail_complete.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.complete(update).await
    }

    async fn release(&self, id: &DeliveryId, claim_token: Uuid) -> Result<(), StoreError> {
        self.inner.release(id, claim_token).await
    }

    async fn retry_now(&self, id: &DeliveryId, now: DateTime<Utc>) -> Result<Delivery, StoreError> {
        self.inner.retry_now(id, now).await
    }
}

/// Storage seeded with [`API_KEY`] for [`OWNER`] and the given endpoints.
pub async fn seeded_storage(endpoints: Vec<Endpoint>) -> Arc<InMemoryStorage> {
    let storage = Arc::new(InMemoryStorage::new());
    storage.put_api_key(ApiKey::issue(OWNER, API_KEY)).await.unwrap();
    for endpoint in endpoints {
        storage.put_endpoint(endpoint).await.unwrap();
    }
    storage
}

pub fn endpoint(id: &str) -> Endpoint {
    Endpoint::new(id, OWNER, format!("http://{}.test/hook", id))
}

pub fn config() -> Arc<PipelineConfig> {
    Arc::new(PipelineConfig::default())
}

pub fn scheduler(
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    config: Arc<PipelineConfig>,
) -> Scheduler {
    Scheduler::new(storage, transport, config)
}

/// Ingest one event through the real ingestion path.
pub async fn ingest(storage: Arc<dyn Storage>, config: Arc<PipelineConfig>, event_type: &str) -> EventId {
    let ingestor = Ingestor::new(storage, config);
    let request = IngestRequest {
        event_type: event_type.to_string(),
        payload: Payload(serde_json::json!({ "order": 42 })),
        source: Some("tests".to_string()),
    };
    ingestor
        .ingest(Some(API_KEY), request, HeaderMap::new())
        .await
        .unwrap()
        .event_id
}

pub fn ms(millis: i64) -> chrono::Duration {
    chrono::Duration::milliseconds(millis)
}

/// Row-level invariants that must hold after every committed transition.
pub fn assert_row_invariants(row: &Delivery) {
    assert!(row.attempt_count <= row.max_attempts, "{:?}", row);
    match row.status {
        DeliveryStatus::Pending => {
            assert!(row.completed_at.is_none(), "{:?}", row);
        }
        DeliveryStatus::Retrying => {
            assert!(row.next_retry_at.is_some(), "{:?}", row);
            assert!(row.completed_at.is_none(), "{:?}", row);
        }
        DeliveryStatus::Success | DeliveryStatus::Failed => {
            assert!(row.completed_at.is_some(), "{:?}", row);
            assert!(row.next_retry_at.is_none(), "{:?}", row);
        }
        DeliveryStatus::InProgress => {
            assert!(row.claim_token.is_some(), "{:?}", row);
        }
    }
    if row.status != DeliveryStatus::InProgress {
        assert!(row.claim_token.is_none(), "{:?}", row);
    }
}
