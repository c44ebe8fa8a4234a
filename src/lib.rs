//! Durable webhook ingestion and delivery.
//!
//! Events arrive over HTTP with an API key, are fanned out to every active
//! endpoint of the key's owner, and persisted together with one delivery row
//! per endpoint. A scheduler claims due rows in bounded batches, sends them
//! with a hard per-endpoint timeout, and commits each outcome against the
//! claim it was made under.
//!
//! ## Guarantees
//! - An event and its fan-out rows are written atomically
//! - At most one (endpoint, event) delivery row
//! - A claimed row is worked by exactly one worker until released or expired
//! - `attempt_count` never exceeds `max_attempts`
//! - Terminal rows (`success`, `failed`) are never redispatched by a cycle
//!
//! ## Non-Guarantees
//! - Exactly-once delivery: a receiver may see a request whose outcome was
//!   never committed
//! - Ordering between deliveries
//!
//! Storage is pluggable behind [`Storage`]; [`InMemoryStorage`] is always
//! available and `PostgresStorage` ships behind the `postgres` feature.

pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod scheduler;
pub mod signing;
pub mod storage;
mod telemetry;
pub mod transport;
pub mod types;
pub mod worker;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use api::{router, AppState};
pub use config::{PipelineConfig, ServerConfig};
pub use credentials::{hash_api_key, CredentialVerifier};
pub use error::{AuthError, ConfigError, DeliveryFailure, IngestError, StoreError, TransportError};
pub use ingest::{IngestReceipt, IngestRequest, Ingestor, API_KEY_HEADER};
pub use scheduler::{CycleReport, DeliveryResult, ResultStatus, Scheduler};
pub use signing::{compute_signature, is_timestamp_fresh, verify_signature, SignatureMode};
pub use storage::{DeliveryUpdate, InMemoryStorage, Storage};
pub use telemetry::init_tracing;
pub use transport::{OutboundRequest, Transport, TransportResponse};
pub use types::{
    ApiKey, ApiKeyId, Delivery, DeliveryId, DeliveryStatus, Endpoint, EndpointId, EndpointStatus,
    Event, EventId, HeaderMap, HttpMethod, OwnerId, Payload, RetryConfig,
};
pub use worker::DeliveryWorker;

#[cfg(feature = "http")]
pub use transport::HttpTransport;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;
