use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header name/value pairs as configured or captured.
///
/// A `BTreeMap` keeps serialized rows stable across writes.
pub type HeaderMap = BTreeMap<String, String>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of the user that owns keys, endpoints and events.
    OwnerId
);
string_id!(
    /// Identifier of a destination endpoint.
    EndpointId
);
string_id!(
    /// Identifier of an ingested event.
    EventId
);
string_id!(
    /// Identifier of a single delivery row.
    DeliveryId
);
string_id!(ApiKeyId);

/// Opaque event payload.
///
/// The pipeline never looks inside; it is stored and forwarded as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(pub serde_json::Value);

impl Payload {
    /// Serialized JSON body sent to destinations.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.0).unwrap_or_default()
    }

    /// Length of the serialized body, used for the ingestion size cap.
    pub fn encoded_len(&self) -> usize {
        self.to_bytes().len()
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Stored credential. The raw key is never persisted, only its hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub owner_id: OwnerId,
    pub key_hash: String,
    pub key_prefix: String,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    #[default]
    Active,
    Inactive,
    Paused,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Active => "active",
            EndpointStatus::Inactive => "inactive",
            EndpointStatus::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(EndpointStatus::Active),
            "inactive" => Some(EndpointStatus::Inactive),
            "paused" => Some(EndpointStatus::Paused),
            _ => None,
        }
    }
}

/// Per-endpoint retry settings. Unset values fall back to the pipeline
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub backoff_ms: Option<u64>,
}

/// Destination for webhook delivery.
///
/// Endpoints are owned by the registry collaborator; the pipeline only reads
/// them. Only `Active` endpoints receive new deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub owner_id: OwnerId,

    /// Target URL for webhook delivery.
    pub url: String,

    #[serde(default)]
    pub method: HttpMethod,

    /// Extra headers sent with every delivery.
    #[serde(default)]
    pub headers: HeaderMap,

    /// Optional signing secret.
    pub secret: Option<String>,

    #[serde(default)]
    pub status: EndpointStatus,

    /// Hard per-attempt timeout. Falls back to the pipeline default.
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub retry_config: RetryConfig,
}

impl Endpoint {
    /// Create an active POST endpoint with default delivery settings.
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: EndpointId(id.into()),
            owner_id: OwnerId(owner_id.into()),
            url: url.into(),
            method: HttpMethod::Post,
            headers: HeaderMap::new(),
            secret: None,
            status: EndpointStatus::Active,
            timeout_ms: None,
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set a secret for request signing.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_status(mut self, status: EndpointStatus) -> Self {
        self.status = status;
        self
    }

    /// Set a custom timeout for delivery attempts.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Override retry parameters for this endpoint.
    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.retry_config = RetryConfig {
            max_attempts: Some(max_attempts),
            backoff_ms: Some(backoff_ms),
        };
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == EndpointStatus::Active
    }
}

/// An ingested event. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub owner_id: OwnerId,
    pub event_type: String,
    pub payload: Payload,
    pub source: Option<String>,

    /// Request headers captured at ingestion.
    pub headers: HeaderMap,
    pub created_at: DateTime<Utc>,

    /// Set once fan-out for this event has been committed.
    pub processed: bool,
}

/// Delivery lifecycle status.
///
/// `InProgress` is the claimed state: exactly one worker holds the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InProgress,
    Retrying,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::InProgress => "in_progress",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryStatus::Pending),
            "in_progress" => Some(DeliveryStatus::InProgress),
            "retrying" => Some(DeliveryStatus::Retrying),
            "success" => Some(DeliveryStatus::Success),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted-or-to-be-attempted transmission of an event to one
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub endpoint_id: EndpointId,
    pub event_id: Option<EventId>,
    pub owner_id: OwnerId,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub request_payload: Payload,
    pub request_headers: HeaderMap,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub response_headers: Option<HeaderMap>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Claim bookkeeping. Both are set only while `InProgress` and never
    /// leave the process in serialized rows.
    #[serde(skip_serializing, default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing, default)]
    pub claim_token: Option<Uuid>,
}

impl Delivery {
    /// Whether the scheduler may pick this row up at `now`.
    ///
    /// Stale `InProgress` claims (claimed before `stale_before`) count as due
    /// so abandoned rows are recovered.
    pub fn is_due(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
        match self.status {
            DeliveryStatus::Pending => self.next_retry_at.map_or(true, |at| at <= now),
            DeliveryStatus::Retrying => self.next_retry_at.map_or(true, |at| at <= now),
            DeliveryStatus::InProgress => self.claimed_at.map_or(true, |at| at < stale_before),
            DeliveryStatus::Success | DeliveryStatus::Failed => false,
        }
    }

    /// Status to fall back to when a claim is given up without an outcome.
    pub fn unclaimed_status(&self) -> DeliveryStatus {
        if self.attempt_count == 0 && self.next_retry_at.is_none() {
            DeliveryStatus::Pending
        } else {
            DeliveryStatus::Retrying
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn delivery(status: DeliveryStatus) -> Delivery {
        Delivery {
            id: DeliveryId::generate(),
            endpoint_id: EndpointId::from("ep"),
            event_id: Some(EventId::from("evt")),
            owner_id: OwnerId::from("owner"),
            status,
            attempt_count: 0,
            max_attempts: 3,
            request_payload: Payload(serde_json::json!({})),
            request_headers: HeaderMap::new(),
            response_status: None,
            response_body: None,
            response_headers: None,
            response_time_ms: None,
            error_message: None,
            created_at: Utc::now(),
            next_retry_at: None,
            completed_at: None,
            claimed_at: None,
            claim_token: None,
        }
    }

    #[test]
    fn claim_fields_are_not_serialized() {
        let mut row = delivery(DeliveryStatus::InProgress);
        row.claimed_at = Some(Utc::now());
        row.claim_token = Some(Uuid::new_v4());

        let json = serde_json::to_value(&row).unwrap();
        assert!(json.get("claim_token").is_none());
        assert!(json.get("claimed_at").is_none());
        assert_eq!(json["status"], "in_progress");

        let back: Delivery = serde_json::from_value(json).unwrap();
        assert!(back.claim_token.is_none());
    }

    #[test]
    fn retrying_rows_wait_for_their_retry_time() {
        let now = Utc::now();
        let mut row = delivery(DeliveryStatus::Retrying);
        row.next_retry_at = Some(now + Duration::seconds(5));
        assert!(!row.is_due(now, now));
        assert!(row.is_due(now + Duration::seconds(5), now));
    }

    #[test]
    fn terminal_rows_are_never_due() {
        let now = Utc::now();
        assert!(!delivery(DeliveryStatus::Success).is_due(now, now));
        assert!(!delivery(DeliveryStatus::Failed).is_due(now, now));
    }

    #[test]
    fn stale_claims_become_due() {
        let now = Utc::now();
        let mut row = delivery(DeliveryStatus::InProgress);
        row.claimed_at = Some(now - Duration::minutes(10));
        assert!(row.is_due(now, now - Duration::minutes(5)));
        assert!(!row.is_due(now, now - Duration::minutes(15)));
    }

    #[test]
    fn method_parsing_is_case_insensitive() {
        assert_eq!(HttpMethod::parse("put"), Some(HttpMethod::Put));
        assert_eq!(HttpMethod::parse("TRACE"), None);
    }
}
