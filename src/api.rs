use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap as HttpHeaders, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AuthError, IngestError, StoreError};
use crate::ingest::{IngestRequest, Ingestor, API_KEY_HEADER};
use crate::scheduler::{CycleReport, Scheduler};
use crate::storage::Storage;
use crate::types::{Delivery, DeliveryId, EventId, HeaderMap, OwnerId};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Shared state behind the router.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub ingestor: Arc<Ingestor>,
    pub scheduler: Arc<Scheduler>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(ingest_event))
        .route("/events/{event_id}/deliveries", get(event_deliveries))
        .route("/deliveries", get(list_deliveries))
        .route("/deliveries/process", post(process_deliveries))
        .route("/deliveries/{delivery_id}", get(get_delivery))
        .route("/deliveries/{delivery_id}/retry", post(retry_delivery))
        .with_state(state)
}

/// JSON error body: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        let status = match &err {
            IngestError::Auth(AuthError::Store(_)) | IngestError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            IngestError::Auth(_) => StatusCode::UNAUTHORIZED,
            IngestError::Validation(_) => StatusCode::BAD_REQUEST,
            IngestError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "ingest failed");
        }
        ApiError::new(status, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) | StoreError::ClaimLost(_) => StatusCode::CONFLICT,
            StoreError::Unavailable(_) | StoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "storage error");
        }
        ApiError::new(status, err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    success: bool,
    event_id: EventId,
    deliveries_queued: usize,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "time": Utc::now() }))
}

async fn ingest_event(
    State(state): State<AppState>,
    headers: HttpHeaders,
    body: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    // The key is verified before the body so unauthenticated callers learn
    // nothing about payload validation.
    let owner = state.ingestor.verify_sender(api_key(&headers)).await?;
    let Json(request) = body.map_err(|rejection| ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text()))?;

    let captured: HeaderMap = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect();

    let receipt = state.ingestor.accept(owner, request, captured).await?;
    Ok(Json(IngestResponse {
        success: true,
        event_id: receipt.event_id,
        deliveries_queued: receipt.deliveries_queued,
    }))
}

async fn process_deliveries(State(state): State<AppState>) -> Result<Json<CycleReport>, ApiError> {
    let report = state.scheduler.run_cycle().await?;
    Ok(Json(report))
}

fn api_key(headers: &HttpHeaders) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

async fn caller(state: &AppState, headers: &HttpHeaders) -> Result<OwnerId, ApiError> {
    let owner = state
        .ingestor
        .authenticate(api_key(headers))
        .await
        .map_err(IngestError::from)?;
    Ok(owner)
}

/// Rows of other owners are reported as missing.
async fn owned_delivery(state: &AppState, owner: &OwnerId, id: &DeliveryId) -> Result<Delivery, ApiError> {
    let delivery = state
        .storage
        .get_delivery(id)
        .await?
        .filter(|delivery| &delivery.owner_id == owner)
        .ok_or_else(|| StoreError::NotFound(format!("delivery {}", id)))?;
    Ok(delivery)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

/// Recent deliveries of the caller, newest first.
async fn list_deliveries(
    State(state): State<AppState>,
    headers: HttpHeaders,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Delivery>>, ApiError> {
    let owner = caller(&state, &headers).await?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.storage.list_deliveries(&owner, limit).await?))
}

async fn get_delivery(
    State(state): State<AppState>,
    headers: HttpHeaders,
    Path(delivery_id): Path<String>,
) -> Result<Json<Delivery>, ApiError> {
    let owner = caller(&state, &headers).await?;
    let delivery = owned_delivery(&state, &owner, &DeliveryId(delivery_id)).await?;
    Ok(Json(delivery))
}

async fn event_deliveries(
    State(state): State<AppState>,
    headers: HttpHeaders,
    Path(event_id): Path<String>,
) -> Result<Json<Vec<Delivery>>, ApiError> {
    let owner = caller(&state, &headers).await?;
    let id = EventId(event_id);
    let owned = state
        .storage
        .get_event(&id)
        .await?
        .is_some_and(|event| event.owner_id == owner);
    if !owned {
        return Err(StoreError::NotFound(format!("event {}", id)).into());
    }
    Ok(Json(state.storage.list_deliveries_for_event(&id).await?))
}

async fn retry_delivery(
    State(state): State<AppState>,
    headers: HttpHeaders,
    Path(delivery_id): Path<String>,
) -> Result<Json<Delivery>, ApiError> {
    let owner = caller(&state, &headers).await?;
    let id = DeliveryId(delivery_id);
    owned_delivery(&state, &owner, &id).await?;
    let delivery = state.storage.retry_now(&id, Utc::now()).await?;
    tracing::info!(delivery_id = %id, owner_id = %owner, "manual retry requested");
    Ok(Json(delivery))
}
