use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::AuthError;
use crate::storage::Storage;
use crate::types::{ApiKey, ApiKeyId, OwnerId};

const PREFIX_LEN: usize = 8;

/// Hex SHA-256 of a raw API key, as stored in `key_hash`.
pub fn hash_api_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

impl ApiKey {
    /// Build the stored record for a raw key issued out-of-band.
    pub fn issue(owner_id: impl Into<String>, raw: &str) -> Self {
        Self {
            id: ApiKeyId::generate(),
            owner_id: OwnerId(owner_id.into()),
            key_hash: hash_api_key(raw),
            key_prefix: raw.chars().take(PREFIX_LEN).collect(),
            is_active: true,
            last_used_at: None,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn revoked(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |at| at > now)
    }
}

/// Resolves inbound API keys to their owner.
///
/// Pure lookup; the only write is the `last_used_at` refresh on success.
pub struct CredentialVerifier {
    storage: Arc<dyn Storage>,
}

impl CredentialVerifier {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn verify(&self, raw_key: Option<&str>) -> Result<OwnerId, AuthError> {
        let raw_key = raw_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(AuthError::MissingKey)?;

        let now = Utc::now();
        let key = self
            .storage
            .find_api_key(&hash_api_key(raw_key))
            .await?
            .filter(|k| k.is_usable_at(now))
            .ok_or(AuthError::InvalidKey)?;

        // Freshness is best effort; a failed touch must not reject the call.
        if let Err(err) = self.storage.touch_api_key(&key.id, now).await {
            tracing::warn!(api_key = %key.key_prefix, error = %err, "failed to refresh last_used_at");
        }

        Ok(key.owner_id)
    }
}
