use std::fmt;

use thiserror::Error;

use crate::types::DeliveryId;

/// Persistence failures. These are system errors: they are surfaced to the
/// operator and never recorded as delivery outcomes.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The row is no longer held by this claim (reclaimed or finished).
    #[error("claim lost for delivery {0}")]
    ClaimLost(DeliveryId),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Credential rejections. Both map to 401.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing API key")]
    MissingKey,

    #[error("Invalid or inactive API key")]
    InvalidKey,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by ingestion *before* anything is persisted, or when the
/// write itself fails.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    Validation(String),

    #[error("payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Why an outbound call produced no HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The attempt hit the endpoint's hard timeout and was cancelled.
    Timeout { after_ms: u64 },

    /// Connection could not be established.
    Connect(String),

    /// Anything else below HTTP (TLS, malformed URL, body errors).
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout { after_ms } =>
                write!(f, "request timed out after {}ms", after_ms),
            TransportError::Connect(msg) =>
                write!(f, "connection failed: {}", msg),
            TransportError::Other(msg) =>
                write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Recorded reason for a failed attempt or a terminal failure.
///
/// These are business outcomes written to the delivery row, not errors
/// propagated to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    Transport(TransportError),
    HttpStatus(u16),
    MaxAttemptsExceeded,
    EndpointNotFound,
    EndpointInactive,
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryFailure::Transport(err) =>
                write!(f, "{}", err),
            DeliveryFailure::HttpStatus(status) =>
                write!(f, "HTTP {}", status),
            DeliveryFailure::MaxAttemptsExceeded =>
                write!(f, "max retry attempts exceeded"),
            DeliveryFailure::EndpointNotFound =>
                write!(f, "endpoint not found"),
            DeliveryFailure::EndpointInactive =>
                write!(f, "endpoint is inactive"),
        }
    }
}
