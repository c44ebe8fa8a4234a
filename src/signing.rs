use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::PipelineConfig;
use crate::types::Endpoint;

type HmacSha256 = Hmac<Sha256>;

/// How the signature header is derived from an endpoint secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMode {
    /// `sha256=<hex hmac>` over `"{timestamp}.{body}"`.
    HmacSha256,
    /// Legacy placeholder: the header carries the raw secret.
    RawSecret,
}

impl SignatureMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "hmac_sha256" | "hmac-sha256" | "hmac" => Some(SignatureMode::HmacSha256),
            "raw_secret" | "raw-secret" | "raw" => Some(SignatureMode::RawSecret),
            _ => None,
        }
    }
}

/// Headers to attach for a signed delivery. Empty when the endpoint has no
/// secret.
pub fn signature_headers(
    endpoint: &Endpoint,
    body: &[u8],
    timestamp_secs: i64,
    config: &PipelineConfig,
) -> Vec<(String, String)> {
    let Some(secret) = endpoint.secret.as_ref() else {
        return Vec::new();
    };

    match config.signature_mode {
        SignatureMode::RawSecret => {
            vec![(config.signature_header.clone(), secret.clone())]
        }
        SignatureMode::HmacSha256 => {
            let timestamp = timestamp_secs.to_string();
            let signature = compute_signature(secret.as_bytes(), body, &timestamp);
            vec![
                (config.signature_header.clone(), format!("sha256={}", signature)),
                (config.timestamp_header.clone(), timestamp),
            ]
        }
    }
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: &str) -> String {
    let mut mac = new_mac(secret);
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a received signature header. Accepts the value with or without the
/// `sha256=` prefix.
pub fn verify_signature(secret: &[u8], payload: &[u8], timestamp: &str, signature: &str) -> bool {
    let signature_hex = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = new_mac(secret);
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: i64, now_secs: i64, max_age_secs: i64) -> bool {
    now_secs >= timestamp_secs && now_secs - timestamp_secs <= max_age_secs
}

fn new_mac(secret: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length, so this never takes the fallback.
    <HmacSha256 as Mac>::new_from_slice(secret)
        .unwrap_or_else(|_| <HmacSha256 as Mac>::new_from_slice(b"default").expect("hmac"))
}
