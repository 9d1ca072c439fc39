//! Bearer token lifecycle: refresh-token grant, PKCE code exchange and the
//! modern/legacy identity endpoint fallback.
//!
//! Endpoints are tried in order on every call, modern first. The endpoint that
//! succeeded is persisted for diagnostics only; it does not change the order
//! of the next attempt.

use std::sync::Arc;

use reqwest::header::ACCEPT;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::credentials::{CredentialStore, TokenResponse};
use crate::logger::{SharedLogger, log_with};
use crate::request::MAX_ERROR_BODY_CHARS;
use crate::store::{StateStore, keys};
use crate::types::{Event, EventSink};
use crate::{Error, Result};

/// Tokens closer than this to expiry are refreshed before use.
pub const REFRESH_LEEWAY_MILLIS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityEndpoint {
    pub name: String,
    pub token_url: String,
}

impl IdentityEndpoint {
    pub fn new(name: impl Into<String>, token_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token_url: token_url.into(),
        }
    }
}

pub struct TokenManager {
    http: reqwest::Client,
    creds: CredentialStore,
    store: Arc<dyn StateStore>,
    endpoints: Vec<IdentityEndpoint>,
    authorize_url: String,
    clock: Arc<dyn Clock>,
    refresh_lock: Mutex<()>,
    logger: Option<SharedLogger>,
    events: EventSink,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        creds: CredentialStore,
        store: Arc<dyn StateStore>,
        endpoints: Vec<IdentityEndpoint>,
        authorize_url: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            creds,
            store,
            endpoints,
            authorize_url: authorize_url.into(),
            clock,
            refresh_lock: Mutex::new(()),
            logger: None,
            events: EventSink::default(),
        }
    }

    pub(crate) fn with_logger(mut self, logger: Option<SharedLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub(crate) fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.creds
    }

    /// Returns the cached token when it has more than a minute left, otherwise
    /// refreshes it. `force` always refreshes.
    pub async fn ensure_valid_token(&self, force: bool) -> Result<String> {
        if !force && !self.needs_refresh() {
            return Ok(self.creds.load().access_token);
        }

        let _guard = self.refresh_lock.lock().await;
        // another caller may have refreshed while we waited
        if !force && !self.needs_refresh() {
            return Ok(self.creds.load().access_token);
        }
        self.refresh().await
    }

    fn needs_refresh(&self) -> bool {
        let auto = self.store.get_bool(keys::AUTO_REFRESH).unwrap_or(true);
        if !auto {
            return false;
        }
        let cred = self.creds.load();
        cred.access_token.is_empty()
            || cred.access_token_expires_at - self.clock.now_millis() <= REFRESH_LEEWAY_MILLIS
    }

    async fn refresh(&self) -> Result<String> {
        let cred = self.creds.load();
        if cred.refresh_token.is_empty() {
            return Err(Error::MissingConfig("refresh token"));
        }
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", cred.refresh_token.clone()),
            ("client_id", cred.client_id.clone()),
        ];
        if let Some(secret) = cred.client_secret {
            form.push(("client_secret", secret));
        }

        let (resp, endpoint) = self.request_token(&form).await?;
        let token = self
            .creds
            .store_token(&resp, &endpoint.token_url, self.clock.now_millis())?;
        info!(endpoint = %endpoint.name, "access token refreshed");
        self.events.emit(&Event::TokenRefreshed {
            endpoint: endpoint.name.clone(),
        });
        Ok(token)
    }

    /// PKCE authorization-code exchange. Persists the result like a refresh.
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<String> {
        let cred = self.creds.load();
        if cred.client_id.is_empty() {
            return Err(Error::MissingConfig("client id"));
        }
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("client_id", cred.client_id.clone()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("code_verifier", verifier.to_string()),
        ];
        if let Some(secret) = cred.client_secret {
            form.push(("client_secret", secret));
        }

        let _guard = self.refresh_lock.lock().await;
        let (resp, endpoint) = self.request_token(&form).await?;
        let token = self
            .creds
            .store_token(&resp, &endpoint.token_url, self.clock.now_millis())?;
        info!(endpoint = %endpoint.name, "access and refresh token stored");
        self.events.emit(&Event::TokenRefreshed {
            endpoint: endpoint.name.clone(),
        });
        Ok(token)
    }

    pub fn authorize_url(&self, client_id: &str, redirect_uri: &str, scope: &str, challenge: &str) -> String {
        format!(
            "{}?client_id={}&response_type=code&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256",
            self.authorize_url,
            urlencoding::encode(client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(scope),
            urlencoding::encode(challenge),
        )
    }

    /// Posts the form to each identity endpoint in order until one returns 2xx.
    async fn request_token(
        &self,
        form: &[(&str, String)],
    ) -> Result<(TokenResponse, &IdentityEndpoint)> {
        let mut statuses = Vec::with_capacity(self.endpoints.len());
        let mut last_body = String::new();

        for endpoint in &self.endpoints {
            debug!(url = %endpoint.token_url, "requesting token");
            log_with(&self.logger, |l| l.log_request("POST", &endpoint.token_url, None));

            let resp = self
                .http
                .post(&endpoint.token_url)
                .header(ACCEPT, "application/json")
                .form(form)
                .send()
                .await?;
            let status = resp.status();
            let body = resp.text().await?;

            if status.is_success() {
                let parsed: TokenResponse = serde_json::from_str(&body)
                    .map_err(|e| Error::Protocol(format!("token response: {e}")))?;
                return Ok((parsed, endpoint));
            }

            warn!(endpoint = %endpoint.name, status = status.as_u16(), "token endpoint rejected request");
            statuses.push(status.as_u16());
            last_body = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        }

        Err(Error::AuthRefresh {
            modern_status: statuses.first().copied().unwrap_or(0),
            legacy_status: statuses.get(1).copied().unwrap_or(0),
            body: last_body,
        })
    }
}
