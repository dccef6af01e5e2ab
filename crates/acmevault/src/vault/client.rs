//! Secrets store HTTP client with retry logic.
//!
//! The client is shared by every component that talks to the store. It holds
//! the live session token in an [`ArcSwapOption`] so the token lifecycle
//! manager can swap it while scheduler workers are mid-request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::{Client, ClientBuilder, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use acmevault_config::VaultConfig;

use super::error::VaultError;
use crate::certificate::SecretData;

/// Header carrying the session token
const TOKEN_HEADER: &str = "X-Vault-Token";

/// Default first retry delay
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Generic API response wrapper
#[derive(Debug, Default, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
    #[serde(default)]
    pub auth: Option<AuthInfo>,
    #[serde(default)]
    pub lease_id: Option<String>,
    #[serde(default)]
    pub lease_duration: Option<u64>,
    #[serde(default)]
    pub renewable: Option<bool>,
}

/// Authentication info from login and renew responses
#[derive(Clone, Deserialize)]
pub struct AuthInfo {
    pub client_token: String,
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
}

impl fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInfo")
            .field("client_token", &"[REDACTED]")
            .field("policies", &self.policies)
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .finish()
    }
}

/// Result of `auth/token/lookup-self`
#[derive(Debug, Clone, Deserialize)]
pub struct TokenLookup {
    /// Remaining TTL in seconds, 0 for tokens without expiry
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub policies: Vec<String>,
}

/// Which token a request is sent with
#[derive(Clone, Copy)]
enum TokenSource<'a> {
    Session,
    Explicit(&'a str),
    Anonymous,
}

/// Secrets store HTTP client
pub struct VaultClient {
    http: Client,
    address: String,
    token: ArcSwapOption<String>,
    max_retries: u32,
    retry_interval: Duration,
}

impl VaultClient {
    /// Create a client for the configured address. No request is made.
    pub fn new(config: &VaultConfig) -> Result<Self, VaultError> {
        Self::with_address(
            &config.addr,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )
    }

    pub fn with_address(
        address: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, VaultError> {
        let http = ClientBuilder::new()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| VaultError::Client(e.to_string()))?;

        Ok(Self {
            http,
            address: address.trim_end_matches('/').to_string(),
            token: ArcSwapOption::empty(),
            max_retries: max_retries.max(1),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        })
    }

    /// Override the first retry delay
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    // =========================================================================
    // Session token
    // =========================================================================

    /// Replace the session token atomically
    pub fn set_token(&self, token: impl Into<String>) {
        self.token.store(Some(Arc::new(token.into())));
    }

    pub fn clear_token(&self) {
        self.token.store(None);
    }

    pub fn has_token(&self) -> bool {
        self.token.load().is_some()
    }

    // =========================================================================
    // KV2 secrets
    // =========================================================================

    /// Read the data of a KV2 secret. `path` includes the `data/` segment.
    pub async fn read_secret(&self, path: &str) -> Result<SecretData, VaultError> {
        let response = self
            .request(Method::GET, path, None, TokenSource::Session)
            .await?
            .ok_or_else(|| VaultError::NotFound {
                path: path.to_string(),
            })?;

        match response.data {
            Some(Value::Object(mut outer)) => match outer.remove("data") {
                Some(Value::Object(inner)) => Ok(inner),
                // Deleted versions come back with `data: null`
                Some(Value::Null) | None => Err(VaultError::NotFound {
                    path: path.to_string(),
                }),
                Some(other) => Err(VaultError::Decode {
                    path: path.to_string(),
                    message: format!("expected object under data.data, got {}", other),
                }),
            },
            _ => Err(VaultError::Decode {
                path: path.to_string(),
                message: "response has no data object".to_string(),
            }),
        }
    }

    /// Write a new version of a KV2 secret
    pub async fn write_secret(&self, path: &str, data: &SecretData) -> Result<(), VaultError> {
        let body = json!({ "data": data });
        self.request(Method::POST, path, Some(&body), TokenSource::Session)
            .await?;
        trace!(path = %path, "Wrote secret");
        Ok(())
    }

    /// Read an arbitrary (non-KV2) path, e.g. a dynamic credentials endpoint
    pub async fn read(&self, path: &str) -> Result<ApiResponse, VaultError> {
        self.request(Method::GET, path, None, TokenSource::Session)
            .await?
            .ok_or_else(|| VaultError::NotFound {
                path: path.to_string(),
            })
    }

    // =========================================================================
    // Auth endpoints
    // =========================================================================

    /// Unauthenticated login against an auth mount, e.g. `auth/approle/login`
    pub async fn login(&self, path: &str, body: &Value) -> Result<AuthInfo, VaultError> {
        let response = self
            .request(Method::POST, path, Some(body), TokenSource::Anonymous)
            .await?
            .unwrap_or_default();

        response
            .auth
            .ok_or_else(|| VaultError::Auth(format!("no auth info in response from '{}'", path)))
    }

    /// Look up a token without installing it as the session token
    pub async fn lookup_token(&self, token: &str) -> Result<TokenLookup, VaultError> {
        self.lookup(TokenSource::Explicit(token)).await
    }

    /// Look up the current session token
    pub async fn lookup_self(&self) -> Result<TokenLookup, VaultError> {
        self.lookup(TokenSource::Session).await
    }

    async fn lookup(&self, source: TokenSource<'_>) -> Result<TokenLookup, VaultError> {
        const PATH: &str = "auth/token/lookup-self";
        let response = self
            .request(Method::GET, PATH, None, source)
            .await?
            .ok_or_else(|| VaultError::Auth("empty lookup-self response".to_string()))?;

        let data = response
            .data
            .ok_or_else(|| VaultError::Auth("lookup-self returned no data".to_string()))?;

        serde_json::from_value(data).map_err(|e| VaultError::Decode {
            path: PATH.to_string(),
            message: e.to_string(),
        })
    }

    /// Renew the session token by `increment`
    pub async fn renew_self(&self, increment: Duration) -> Result<AuthInfo, VaultError> {
        const PATH: &str = "auth/token/renew-self";
        let body = json!({ "increment": format!("{}s", increment.as_secs()) });
        let response = self
            .request(Method::POST, PATH, Some(&body), TokenSource::Session)
            .await?
            .unwrap_or_default();

        response
            .auth
            .ok_or_else(|| VaultError::Auth("renew-self returned no auth data".to_string()))
    }

    /// Revoke the session token and forget it
    pub async fn revoke_self(&self) -> Result<(), VaultError> {
        self.request(
            Method::POST,
            "auth/token/revoke-self",
            None,
            TokenSource::Session,
        )
        .await?;
        self.clear_token();
        Ok(())
    }

    // =========================================================================
    // Transport
    // =========================================================================

    /// Make a request with automatic retry on transient failures.
    ///
    /// Returns `None` for responses without a body (204).
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        source: TokenSource<'_>,
    ) -> Result<Option<ApiResponse>, VaultError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.retry_interval,
            current_interval: self.retry_interval,
            max_interval: self.retry_interval * 8,
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.do_request(&method, path, body, source).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if attempts >= self.max_retries || !e.is_retryable() {
                        return Err(e);
                    }

                    match backoff.next_backoff() {
                        Some(delay) => {
                            warn!(
                                path = %path,
                                error = %e,
                                attempt = attempts,
                                delay_ms = delay.as_millis() as u64,
                                "Retrying request after transient failure"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e),
                    }
                }
            }
        }
    }

    /// Execute a single request
    async fn do_request(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        source: TokenSource<'_>,
    ) -> Result<Option<ApiResponse>, VaultError> {
        let path = path.trim_start_matches('/');
        let url = format!("{}/v1/{}", self.address, path);

        let mut request = self.http.request(method.clone(), &url);

        match source {
            TokenSource::Session => {
                let token = self.token.load_full().ok_or(VaultError::NotAuthenticated)?;
                request = request.header(TOKEN_HEADER, token.as_str());
            }
            TokenSource::Explicit(token) => {
                request = request.header(TOKEN_HEADER, token);
            }
            TokenSource::Anonymous => {}
        }

        if let Some(b) = body {
            request = request.json(b);
        }

        debug!(method = %method, path = %path, "Sending request");

        let response = request.send().await.map_err(|source| VaultError::Transport {
            path: path.to_string(),
            source,
        })?;

        let status = response.status();
        match status {
            StatusCode::NO_CONTENT => Ok(None),
            s if s.is_success() => {
                let text = response.text().await.map_err(|source| VaultError::Transport {
                    path: path.to_string(),
                    source,
                })?;
                if text.trim().is_empty() {
                    return Ok(None);
                }
                serde_json::from_str(&text)
                    .map(Some)
                    .map_err(|e| VaultError::Decode {
                        path: path.to_string(),
                        message: e.to_string(),
                    })
            }
            StatusCode::NOT_FOUND => Err(VaultError::NotFound {
                path: path.to_string(),
            }),
            StatusCode::FORBIDDEN => Err(VaultError::PermissionDenied {
                path: path.to_string(),
            }),
            _ => {
                let text = response.text().await.unwrap_or_default();
                Err(VaultError::Status {
                    path: path.to_string(),
                    status: status.as_u16(),
                    body: text,
                })
            }
        }
    }
}

impl fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultClient")
            .field("address", &self.address)
            .field("authenticated", &self.has_token())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
