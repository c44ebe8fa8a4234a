use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use crate::config::PipelineConfig;
use crate::credentials::CredentialVerifier;
use crate::error::{AuthError, IngestError};
use crate::fanout::fan_out;
use crate::telemetry::metric_inc;
use crate::storage::Storage;
use crate::types::{Event, EventId, HeaderMap, OwnerId, Payload};

/// Header carrying the caller's API key. Never persisted with the event.
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub event_type: String,
    #[serde(default = "null_payload")]
    pub payload: Payload,
    #[serde(default)]
    pub source: Option<String>,
}

fn null_payload() -> Payload {
    Payload(serde_json::Value::Null)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub event_id: EventId,
    pub deliveries_queued: usize,
}

/// Accepts inbound events: verify, validate, then persist the event and its
/// fan-out rows in one write.
pub struct Ingestor {
    storage: Arc<dyn Storage>,
    verifier: CredentialVerifier,
    config: Arc<PipelineConfig>,
}

impl Ingestor {
    pub fn new(storage: Arc<dyn Storage>, config: Arc<PipelineConfig>) -> Self {
        Self {
            verifier: CredentialVerifier::new(storage.clone()),
            storage,
            config,
        }
    }

    /// Resolve an API key to its owner without ingesting anything.
    pub async fn authenticate(&self, api_key: Option<&str>) -> Result<OwnerId, AuthError> {
        self.verifier.verify(api_key).await
    }

    /// Verify the key of an ingest call. Rejections are counted.
    pub async fn verify_sender(&self, api_key: Option<&str>) -> Result<OwnerId, IngestError> {
        self.verifier.verify(api_key).await.map_err(|err| {
            metric_inc("webhook.ingest.unauthorized");
            tracing::debug!(error = %err, "ingest rejected");
            IngestError::from(err)
        })
    }

    pub async fn ingest(
        &self,
        api_key: Option<&str>,
        request: IngestRequest,
        headers: HeaderMap,
    ) -> Result<IngestReceipt, IngestError> {
        let owner_id = self.verify_sender(api_key).await?;
        self.accept(owner_id, request, headers).await
    }

    /// Validate and persist an event for an already verified owner.
    pub async fn accept(
        &self,
        owner: OwnerId,
        request: IngestRequest,
        headers: HeaderMap,
    ) -> Result<IngestReceipt, IngestError> {
        let event_type = request.event_type.trim();
        if event_type.is_empty() {
            return Err(IngestError::Validation("event_type must be a non-empty string".to_string()));
        }

        let size = request.payload.encoded_len();
        if size > self.config.max_payload_bytes {
            return Err(IngestError::PayloadTooLarge {
                size,
                limit: self.config.max_payload_bytes,
            });
        }

        let event = Event {
            id: EventId::generate(),
            owner_id: owner.clone(),
            event_type: event_type.to_string(),
            payload: request.payload,
            source: request.source.filter(|s| !s.is_empty()),
            headers: headers
                .into_iter()
                .filter(|(name, _)| !name.eq_ignore_ascii_case(API_KEY_HEADER))
                .collect(),
            created_at: Utc::now(),
            processed: false,
        };

        let endpoints = self.storage.list_active_endpoints(&owner).await?;
        let deliveries = fan_out(&event, &endpoints, &self.config);
        let receipt = IngestReceipt {
            event_id: event.id.clone(),
            deliveries_queued: deliveries.len(),
        };

        let event_type = event.event_type.clone();
        self.storage.insert_event(event, deliveries).await?;
        tracing::info!(
            event_id = %receipt.event_id,
            owner_id = %owner,
            event_type = %event_type,
            deliveries = receipt.deliveries_queued,
            "event accepted"
        );
        metric_inc("webhook.ingest.accepted");

        Ok(receipt)
    }
}
