use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{DeliveryFailure, StoreError, TransportError};
use crate::signing::signature_headers;
use crate::storage::{DeliveryUpdate, Storage};
use crate::telemetry::{metric_inc, metric_inc_endpoint};
use crate::transport::{OutboundRequest, Transport, TransportResponse};
use crate::types::{Delivery, DeliveryStatus, Endpoint, EndpointStatus, HeaderMap};

/// What a single attempt produced, before it is folded into the row.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Response {
        response: TransportResponse,
        elapsed_ms: u64,
    },
    Error {
        error: TransportError,
        elapsed_ms: u64,
    },
}

impl AttemptOutcome {
    fn elapsed_ms(&self) -> u64 {
        match self {
            AttemptOutcome::Response { elapsed_ms, .. } | AttemptOutcome::Error { elapsed_ms, .. } => {
                *elapsed_ms
            }
        }
    }
}

/// Performs the outbound call for one claimed delivery and commits the
/// result.
///
/// Destination failures never surface as errors here: they are written to
/// the row and drive the retry schedule. Only storage failures are returned,
/// in which case nothing about the attempt has been committed.
pub struct DeliveryWorker {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    config: Arc<PipelineConfig>,
}

impl DeliveryWorker {
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self { storage, transport, config }
    }

    /// Process a claimed row whose turn came at `started_at`. Returns the row
    /// as committed.
    pub async fn process(&self, claimed: Delivery, started_at: DateTime<Utc>) -> Result<Delivery, StoreError> {
        let token = claimed.claim_token.ok_or_else(|| {
            StoreError::Conflict(format!("delivery {} is not claimed", claimed.id))
        })?;

        // The row may have sat behind the concurrency limit; make sure it is
        // still ours and restart its ttl before anything goes out.
        if let Err(err) = self.storage.refresh_claim(&claimed.id, token, started_at).await {
            if matches!(err, StoreError::ClaimLost(_)) {
                metric_inc("webhook.claim.contended");
                tracing::warn!(delivery_id = %claimed.id, "claim taken over before sending");
            } else {
                self.give_back(&claimed, token).await;
            }
            return Err(err);
        }

        let update = match self.prepare(&claimed, token, started_at).await {
            Ok(update) => update,
            Err(err) => {
                self.give_back(&claimed, token).await;
                return Err(err);
            }
        };

        match self.storage.complete(&update).await {
            Ok(row) => {
                record_outcome(&row);
                Ok(row)
            }
            Err(err) => {
                tracing::error!(
                    delivery_id = %claimed.id,
                    error = %err,
                    "failed to commit delivery outcome"
                );
                if matches!(err, StoreError::ClaimLost(_)) {
                    metric_inc("webhook.claim.contended");
                } else {
                    self.give_back(&claimed, token).await;
                }
                Err(err)
            }
        }
    }

    async fn prepare(
        &self,
        claimed: &Delivery,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<DeliveryUpdate, StoreError> {
        if claimed.attempt_count >= claimed.max_attempts {
            return Ok(terminal(claimed, token, DeliveryFailure::MaxAttemptsExceeded, now));
        }

        let Some(endpoint) = self.storage.get_endpoint(&claimed.endpoint_id).await? else {
            return Ok(terminal(claimed, token, DeliveryFailure::EndpointNotFound, now));
        };

        match endpoint.status {
            EndpointStatus::Active => {}
            EndpointStatus::Inactive => {
                return Ok(terminal(claimed, token, DeliveryFailure::EndpointInactive, now));
            }
            EndpointStatus::Paused => {
                let delay = Duration::from_millis(backoff_ms(&endpoint, &self.config));
                return Ok(DeliveryUpdate {
                    error_message: Some("endpoint is paused".to_string()),
                    next_retry_at: Some(after(now, delay)),
                    ..unchanged(claimed, token, DeliveryStatus::Retrying)
                });
            }
        }

        let request = build_request(claimed, &endpoint, now, &self.config);
        let timeout_ms = self.config.attempt_timeout_ms(endpoint.timeout_ms);

        tracing::debug!(
            delivery_id = %claimed.id,
            endpoint_id = %endpoint.id,
            attempt = claimed.attempt_count + 1,
            timeout_ms,
            "sending webhook"
        );
        let outcome = attempt(self.transport.as_ref(), request, timeout_ms).await;
        let finished_at = now + chrono::Duration::milliseconds(outcome.elapsed_ms() as i64);

        Ok(settle(claimed, token, &endpoint, outcome, finished_at, &self.config))
    }

    async fn give_back(&self, claimed: &Delivery, token: Uuid) {
        if let Err(err) = self.storage.release(&claimed.id, token).await {
            tracing::warn!(
                delivery_id = %claimed.id,
                error = %err,
                "could not release claim; it will be reclaimed after the claim ttl"
            );
        }
    }
}

/// Issue one request, cancelled at the timeout boundary.
pub async fn attempt(transport: &dyn Transport, request: OutboundRequest, timeout_ms: u64) -> AttemptOutcome {
    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_millis(timeout_ms), transport.send(request)).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(response)) => AttemptOutcome::Response { response, elapsed_ms },
        Ok(Err(TransportError::Timeout { .. })) | Err(_) => AttemptOutcome::Error {
            error: TransportError::Timeout { after_ms: elapsed_ms },
            elapsed_ms,
        },
        Ok(Err(error)) => AttemptOutcome::Error { error, elapsed_ms },
    }
}

/// Endpoint headers, JSON content type and signature headers over the
/// serialized payload.
pub fn build_request(
    delivery: &Delivery,
    endpoint: &Endpoint,
    now: DateTime<Utc>,
    config: &PipelineConfig,
) -> OutboundRequest {
    let body = delivery.request_payload.to_bytes();

    let mut headers: HeaderMap = endpoint
        .headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("content-type"))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.extend(signature_headers(endpoint, &body, now.timestamp(), config));

    OutboundRequest {
        method: endpoint.method,
        url: endpoint.url.clone(),
        headers,
        body,
    }
}

/// Fold an attempt into the row's next state.
///
/// 2xx is success. Anything else counts the attempt and either schedules a
/// retry at `finished_at + backoff * 2^(attempt_count - 1)` or, once
/// `attempt_count` reaches `max_attempts`, fails the row for good.
pub fn settle(
    claimed: &Delivery,
    token: Uuid,
    endpoint: &Endpoint,
    outcome: AttemptOutcome,
    finished_at: DateTime<Utc>,
    config: &PipelineConfig,
) -> DeliveryUpdate {
    let attempt_count = claimed.attempt_count + 1;

    let (response_status, response_body, response_headers, response_time_ms, failure) = match outcome {
        AttemptOutcome::Response { response, elapsed_ms } => {
            let failure = (!(200..300).contains(&response.status))
                .then_some(DeliveryFailure::HttpStatus(response.status));
            (
                Some(response.status),
                Some(truncate_body(&response.body, config.response_body_limit)),
                Some(response.headers),
                Some(elapsed_ms),
                failure,
            )
        }
        AttemptOutcome::Error { error, elapsed_ms } => {
            (None, None, None, Some(elapsed_ms), Some(DeliveryFailure::Transport(error)))
        }
    };

    let base = DeliveryUpdate {
        id: claimed.id.clone(),
        claim_token: token,
        status: DeliveryStatus::Success,
        attempt_count,
        response_status,
        response_body,
        response_headers,
        response_time_ms,
        error_message: None,
        next_retry_at: None,
        completed_at: Some(finished_at),
    };

    let Some(failure) = failure else {
        return base;
    };

    if attempt_count < claimed.max_attempts {
        let delay = retry_delay(backoff_ms(endpoint, config), attempt_count, config.max_backoff_ms)
            + jitter_delay(config.retry_jitter_ms);
        DeliveryUpdate {
            status: DeliveryStatus::Retrying,
            error_message: Some(failure.to_string()),
            next_retry_at: Some(after(finished_at, delay)),
            completed_at: None,
            ..base
        }
    } else {
        DeliveryUpdate {
            status: DeliveryStatus::Failed,
            error_message: Some(failure.to_string()),
            ..base
        }
    }
}

/// `backoff_ms * 2^(attempt - 1)`, capped at `max_ms`.
pub fn retry_delay(backoff_ms: u64, attempt: u32, max_ms: u64) -> Duration {
    let base = backoff_ms.max(1);
    let max = max_ms.max(base);
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base.saturating_mul(pow).min(max))
}

fn backoff_ms(endpoint: &Endpoint, config: &PipelineConfig) -> u64 {
    endpoint.retry_config.backoff_ms.unwrap_or(config.default_backoff_ms)
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Lossy UTF-8 of the body, cut to at most `limit` bytes on a char boundary.
fn truncate_body(body: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= limit {
        return text.into_owned();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn unchanged(claimed: &Delivery, token: Uuid, status: DeliveryStatus) -> DeliveryUpdate {
    DeliveryUpdate {
        id: claimed.id.clone(),
        claim_token: token,
        status,
        attempt_count: claimed.attempt_count,
        response_status: claimed.response_status,
        response_body: claimed.response_body.clone(),
        response_headers: claimed.response_headers.clone(),
        response_time_ms: claimed.response_time_ms,
        error_message: claimed.error_message.clone(),
        next_retry_at: None,
        completed_at: None,
    }
}

/// Terminal failure without an HTTP call; the attempt count is untouched.
fn terminal(claimed: &Delivery, token: Uuid, failure: DeliveryFailure, now: DateTime<Utc>) -> DeliveryUpdate {
    DeliveryUpdate {
        error_message: Some(failure.to_string()),
        completed_at: Some(now),
        ..unchanged(claimed, token, DeliveryStatus::Failed)
    }
}

fn record_outcome(row: &Delivery) {
    match row.status {
        DeliveryStatus::Success => {
            metric_inc("webhook.delivery.success");
            metric_inc_endpoint("webhook.delivery.success.endpoint", &row.endpoint_id);
            tracing::info!(
                delivery_id = %row.id,
                endpoint_id = %row.endpoint_id,
                attempt = row.attempt_count,
                status = ?row.response_status,
                elapsed_ms = ?row.response_time_ms,
                "webhook delivered"
            );
        }
        DeliveryStatus::Retrying => {
            metric_inc("webhook.delivery.retry_scheduled");
            tracing::warn!(
                delivery_id = %row.id,
                endpoint_id = %row.endpoint_id,
                attempt = row.attempt_count,
                next_retry_at = ?row.next_retry_at,
                error = ?row.error_message,
                "webhook attempt failed, retry scheduled"
            );
        }
        DeliveryStatus::Failed => {
            metric_inc("webhook.delivery.failed");
            metric_inc_endpoint("webhook.delivery.failed.endpoint", &row.endpoint_id);
            tracing::warn!(
                delivery_id = %row.id,
                endpoint_id = %row.endpoint_id,
                attempt = row.attempt_count,
                error = ?row.error_message,
                "webhook delivery failed permanently"
            );
        }
        DeliveryStatus::Pending | DeliveryStatus::InProgress => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeliveryId, EndpointId, EventId, OwnerId, Payload};

    fn claimed(attempt_count: u32, max_attempts: u32) -> Delivery {
        Delivery {
            id: DeliveryId::generate(),
            endpoint_id: EndpointId::from("ep"),
            event_id: Some(EventId::from("evt")),
            owner_id: OwnerId::from("owner"),
            status: DeliveryStatus::InProgress,
            attempt_count,
            max_attempts,
            request_payload: Payload(serde_json::json!({"id": 1})),
            request_headers: HeaderMap::new(),
            response_status: None,
            response_body: None,
            response_headers: None,
            response_time_ms: None,
            error_message: None,
            created_at: Utc::now(),
            next_retry_at: None,
            completed_at: None,
            claimed_at: Some(Utc::now()),
            claim_token: Some(Uuid::new_v4()),
        }
    }

    fn response(status: u16, body: &str) -> AttemptOutcome {
        AttemptOutcome::Response {
            response: TransportResponse {
                status,
                headers: HeaderMap::new(),
                body: body.as_bytes().to_vec(),
            },
            elapsed_ms: 12,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        assert_eq!(retry_delay(1000, 1, u64::MAX), Duration::from_millis(1000));
        assert_eq!(retry_delay(1000, 2, u64::MAX), Duration::from_millis(2000));
        assert_eq!(retry_delay(1000, 3, u64::MAX), Duration::from_millis(4000));
        assert_eq!(retry_delay(1000, 10, 5000), Duration::from_millis(5000));
        assert_eq!(retry_delay(1000, 200, u64::MAX), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn success_completes_the_row() {
        let row = claimed(0, 3);
        let endpoint = Endpoint::new("ep", "owner", "http://x");
        let now = Utc::now();
        let update = settle(&row, Uuid::nil(), &endpoint, response(204, ""), now, &PipelineConfig::default());

        assert_eq!(update.status, DeliveryStatus::Success);
        assert_eq!(update.attempt_count, 1);
        assert_eq!(update.response_status, Some(204));
        assert_eq!(update.completed_at, Some(now));
        assert!(update.next_retry_at.is_none());
        update.validate(row.max_attempts).unwrap();
    }

    #[test]
    fn failure_schedules_retry_from_endpoint_backoff() {
        let row = claimed(1, 3);
        let endpoint = Endpoint::new("ep", "owner", "http://x").with_retry(3, 500);
        let now = Utc::now();
        let update = settle(&row, Uuid::nil(), &endpoint, response(503, "busy"), now, &PipelineConfig::default());

        assert_eq!(update.status, DeliveryStatus::Retrying);
        assert_eq!(update.attempt_count, 2);
        assert_eq!(update.next_retry_at, Some(now + chrono::Duration::milliseconds(1000)));
        assert_eq!(update.error_message.as_deref(), Some("HTTP 503"));
        assert_eq!(update.response_body.as_deref(), Some("busy"));
        assert!(update.completed_at.is_none());
    }

    #[test]
    fn last_failure_is_terminal() {
        let row = claimed(2, 3);
        let endpoint = Endpoint::new("ep", "owner", "http://x");
        let outcome = AttemptOutcome::Error {
            error: TransportError::Connect("refused".to_string()),
            elapsed_ms: 3,
        };
        let now = Utc::now();
        let update = settle(&row, Uuid::nil(), &endpoint, outcome, now, &PipelineConfig::default());

        assert_eq!(update.status, DeliveryStatus::Failed);
        assert_eq!(update.attempt_count, 3);
        assert!(update.next_retry_at.is_none());
        assert_eq!(update.completed_at, Some(now));
        assert!(update.response_status.is_none());
        update.validate(row.max_attempts).unwrap();
    }

    #[test]
    fn bodies_are_truncated_on_char_boundaries() {
        let body = "é".repeat(600);
        let kept = truncate_body(body.as_bytes(), 1000);
        assert_eq!(kept.len(), 1000);
        let kept = truncate_body(body.as_bytes(), 999);
        assert_eq!(kept.len(), 998);
        assert_eq!(truncate_body(b"short", 1000), "short");
    }

    #[test]
    fn request_merges_headers_and_signs() {
        let row = claimed(0, 3);
        let endpoint = Endpoint::new("ep", "owner", "http://x/hook")
            .with_header("content-type", "text/plain")
            .with_header("X-Env", "prod")
            .with_secret("k");
        let request = build_request(&row, &endpoint, Utc::now(), &PipelineConfig::default());

        assert_eq!(request.headers.get("Content-Type").map(String::as_str), Some("application/json"));
        assert!(!request.headers.contains_key("content-type"));
        assert_eq!(request.headers.get("X-Env").map(String::as_str), Some("prod"));
        assert!(request.headers.contains_key("X-Webhook-Signature"));
        assert_eq!(request.body, br#"{"id":1}"#.to_vec());
    }
}
