use crate::config::PipelineConfig;
use crate::types::{Delivery, DeliveryId, DeliveryStatus, Endpoint, Event};

/// Build one `pending` delivery per active endpoint of the event's owner.
///
/// Endpoints that are not active, or belong to someone else, are skipped.
/// Duplicate endpoint ids produce a single row.
pub fn fan_out(event: &Event, endpoints: &[Endpoint], config: &PipelineConfig) -> Vec<Delivery> {
    let mut seen = std::collections::HashSet::new();

    endpoints
        .iter()
        .filter(|endpoint| endpoint.is_active() && endpoint.owner_id == event.owner_id)
        .filter(|endpoint| seen.insert(endpoint.id.clone()))
        .map(|endpoint| Delivery {
            id: DeliveryId::generate(),
            endpoint_id: endpoint.id.clone(),
            event_id: Some(event.id.clone()),
            owner_id: event.owner_id.clone(),
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            max_attempts: endpoint
                .retry_config
                .max_attempts
                .unwrap_or(config.default_max_attempts)
                .max(1),
            request_payload: event.payload.clone(),
            request_headers: endpoint.headers.clone(),
            response_status: None,
            response_body: None,
            response_headers: None,
            response_time_ms: None,
            error_message: None,
            created_at: event.created_at,
            next_retry_at: None,
            completed_at: None,
            claimed_at: None,
            claim_token: None,
        })
        .collect()
}
