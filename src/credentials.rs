//! Persisted OAuth credentials and the PKCE verifier/challenge pair.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::Result;
use crate::store::{StateStore, keys};

/// Seconds subtracted from the provider-reported lifetime before storing expiry.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 30;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credential {
    pub access_token: String,
    /// Unix millis, already reduced by [`EXPIRY_SAFETY_MARGIN_SECS`].
    pub access_token_expires_at: i64,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub token_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Typed view of the `Auth.*` keys. Values missing from the store fall back
/// to the seed credential supplied from configuration.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn StateStore>,
    seed: Credential,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn StateStore>, seed: Credential) -> Self {
        Self { store, seed }
    }

    pub fn load(&self) -> Credential {
        let s = &self.store;
        Credential {
            access_token: s
                .get_str(keys::ACCESS_TOKEN)
                .unwrap_or_else(|| self.seed.access_token.clone()),
            access_token_expires_at: s
                .get_f64(keys::ACCESS_TOKEN_EXPIRES_AT)
                .map(|v| v as i64)
                .unwrap_or(self.seed.access_token_expires_at),
            refresh_token: s
                .get_str(keys::REFRESH_TOKEN)
                .unwrap_or_else(|| self.seed.refresh_token.clone()),
            client_id: s
                .get_str(keys::CLIENT_ID)
                .unwrap_or_else(|| self.seed.client_id.clone()),
            client_secret: s
                .get_str(keys::CLIENT_SECRET)
                .or_else(|| self.seed.client_secret.clone())
                .filter(|v| !v.is_empty()),
            token_endpoint: s.get_str(keys::TOKEN_ENDPOINT).unwrap_or_default(),
        }
    }

    /// Persist a successful token response. Returns the new access token.
    pub fn store_token(&self, resp: &TokenResponse, endpoint: &str, now_millis: i64) -> Result<String> {
        let expires_at = match resp.expires_in {
            Some(secs) if secs > 0 => {
                now_millis + (secs - EXPIRY_SAFETY_MARGIN_SECS).max(0) * 1000
            }
            _ => 0,
        };
        self.store.set(keys::ACCESS_TOKEN, json!(resp.access_token))?;
        self.store.set(keys::ACCESS_TOKEN_EXPIRES_AT, json!(expires_at))?;
        if let Some(rotated) = resp.refresh_token.as_deref().filter(|r| !r.is_empty()) {
            self.store.set(keys::REFRESH_TOKEN, json!(rotated))?;
        }
        if !endpoint.is_empty() {
            self.store.set(keys::TOKEN_ENDPOINT, json!(endpoint))?;
        }
        let info = json!({
            "token_type": resp.token_type,
            "expires_in": resp.expires_in,
            "scope": resp.scope,
        });
        self.store.set(keys::TOKEN_INFO, json!(info.to_string()))?;
        Ok(resp.access_token.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    /// Random 32-byte verifier and its S256 challenge, both base64url without padding.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let digest = Sha256::digest(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(digest);
        Self {
            verifier,
            challenge,
        }
    }
}
