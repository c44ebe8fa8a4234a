use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::signing::SignatureMode;

/// Pipeline-wide settings, passed explicitly to every component.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rows claimed per scheduler cycle.
    pub batch_size: usize,
    /// Parallel outbound calls within one cycle.
    pub max_concurrent_deliveries: usize,
    pub default_timeout_ms: u64,
    pub default_backoff_ms: u64,
    pub default_max_attempts: u32,
    /// Ceiling for the exponential retry delay.
    pub max_backoff_ms: u64,
    pub retry_jitter_ms: u64,
    /// Cap on the serialized ingestion payload.
    pub max_payload_bytes: usize,
    /// Bytes of response body kept on the delivery row.
    pub response_body_limit: usize,
    /// `in_progress` claims older than this may be reclaimed.
    pub claim_ttl_ms: u64,
    pub signature_header: String,
    pub timestamp_header: String,
    pub signature_mode: SignatureMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_deliveries: 10,
            default_timeout_ms: 30_000,
            default_backoff_ms: 1_000,
            default_max_attempts: 3,
            max_backoff_ms: 3_600_000,
            retry_jitter_ms: 0,
            max_payload_bytes: 1024 * 1024,
            response_body_limit: 1_000,
            claim_ttl_ms: 300_000,
            signature_header: "X-Webhook-Signature".to_string(),
            timestamp_header: "X-Webhook-Timestamp".to_string(),
            signature_mode: SignatureMode::HmacSha256,
        }
    }
}

impl PipelineConfig {
    /// Build from `WEBHOOK_*` environment variables, keeping defaults for
    /// anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PipelineConfig::from_env`] with an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        parse_into(&lookup, "WEBHOOK_BATCH_SIZE", &mut config.batch_size)?;
        parse_into(&lookup, "WEBHOOK_MAX_CONCURRENT", &mut config.max_concurrent_deliveries)?;
        parse_into(&lookup, "WEBHOOK_DEFAULT_TIMEOUT_MS", &mut config.default_timeout_ms)?;
        parse_into(&lookup, "WEBHOOK_DEFAULT_BACKOFF_MS", &mut config.default_backoff_ms)?;
        parse_into(&lookup, "WEBHOOK_DEFAULT_MAX_ATTEMPTS", &mut config.default_max_attempts)?;
        parse_into(&lookup, "WEBHOOK_MAX_BACKOFF_MS", &mut config.max_backoff_ms)?;
        parse_into(&lookup, "WEBHOOK_RETRY_JITTER_MS", &mut config.retry_jitter_ms)?;
        parse_into(&lookup, "WEBHOOK_MAX_PAYLOAD_BYTES", &mut config.max_payload_bytes)?;
        parse_into(&lookup, "WEBHOOK_RESPONSE_BODY_LIMIT", &mut config.response_body_limit)?;
        parse_into(&lookup, "WEBHOOK_CLAIM_TTL_MS", &mut config.claim_ttl_ms)?;

        if let Some(header) = lookup("WEBHOOK_SIGNATURE_HEADER") {
            config.signature_header = header;
        }
        if let Some(header) = lookup("WEBHOOK_TIMESTAMP_HEADER") {
            config.timestamp_header = header;
        }
        if let Some(mode) = lookup("WEBHOOK_SIGNATURE_MODE") {
            config.signature_mode = SignatureMode::parse(&mode).ok_or(ConfigError::Invalid {
                key: "WEBHOOK_SIGNATURE_MODE",
                value: mode,
            })?;
        }

        Ok(config)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms)
    }

    /// Timeout for one outbound call. Always ends a tenth of the claim ttl
    /// before the claim could be taken over by another cycle.
    pub fn attempt_timeout_ms(&self, endpoint_timeout_ms: Option<u64>) -> u64 {
        let ceiling = self.claim_ttl_ms.saturating_sub(self.claim_ttl_ms / 10).max(1);
        endpoint_timeout_ms
            .unwrap_or(self.default_timeout_ms)
            .clamp(1, ceiling)
    }
}

/// Settings used only by the server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// When set, the server runs the scheduler itself on this interval
    /// instead of waiting for an external trigger.
    pub scheduler_interval: Option<Duration>,
    pub database_url: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut bind_addr = SocketAddr::from(([0, 0, 0, 0], 8080));
        parse_into(&lookup, "WEBHOOK_BIND_ADDR", &mut bind_addr)?;

        let mut interval_ms: u64 = 0;
        parse_into(&lookup, "WEBHOOK_SCHEDULER_INTERVAL_MS", &mut interval_ms)?;

        Ok(Self {
            bind_addr,
            scheduler_interval: (interval_ms > 0).then(|| Duration::from_millis(interval_ms)),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
        })
    }
}

fn parse_into<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw })?;
    }
    Ok(())
}
