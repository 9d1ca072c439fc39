use std::sync::Arc;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::auth::TokenManager;
use crate::logger::{SharedLogger, log_with};
use crate::{Error, Result};

/// Error bodies are cut to this many characters before they land in an [`Error`].
pub(crate) const MAX_ERROR_BODY_CHARS: usize = 400;

/// Final response of an authenticated call.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
    /// Parsed body, `None` when the body is not valid JSON.
    pub json: Option<Value>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-2xx response into [`Error::HttpStatus`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::HttpStatus {
                status: self.status,
                body: self.body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            })
        }
    }
}

/// Authenticated client for the features API. A 401 forces one token
/// refresh and one retry; anything after that is returned as-is.
#[derive(Clone)]
pub struct RequestClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    logger: Option<SharedLogger>,
}

impl RequestClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, tokens: Arc<TokenManager>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            logger: None,
        }
    }

    pub(crate) fn with_logger(mut self, logger: Option<SharedLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub(crate) fn logger(&self) -> &Option<SharedLogger> {
        &self.logger
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.call(Method::GET, path, None).await
    }

    pub async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<ApiResponse> {
        let bytes = serde_json::to_vec(body)?;
        self.call(Method::POST, path, Some(bytes)).await
    }

    async fn call(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<ApiResponse> {
        let token = self.tokens.ensure_valid_token(false).await?;
        let mut resp = self.send(&method, path, body.clone(), &token).await?;

        if resp.status == StatusCode::UNAUTHORIZED.as_u16() {
            debug!(path = %path, "401 received, forcing token refresh");
            let token = self.tokens.ensure_valid_token(true).await?;
            resp = self.send(&method, path, body, &token).await?;
        }
        Ok(resp)
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        body: Option<Vec<u8>>,
        token: &str,
    ) -> Result<ApiResponse> {
        // every attempt is logged, the retry after a 401 included
        log_with(&self.logger, |l| {
            let logged = body.as_deref().and_then(|b| serde_json::from_slice(b).ok());
            l.log_request(method.as_str(), path, logged.as_ref());
        });

        let url = format!("{}{}", self.base_url, path);
        trace!(method = %method, url = %url, "sending request");

        let mut req = self
            .http
            .request(method.clone(), &url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(ACCEPT, "application/json");
        if let Some(bytes) = body {
            req = req.header(CONTENT_TYPE, "application/json").body(bytes);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        let json = if body.trim().is_empty() {
            None
        } else {
            serde_json::from_str(&body).ok()
        };
        log_with(&self.logger, |l| l.log_response(method.as_str(), path, status));
        Ok(ApiResponse { status, body, json })
    }
}
