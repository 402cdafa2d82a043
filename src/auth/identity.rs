//! Federated identity token provider
//!
//! Mints a short-lived access token by presenting a workload's subject token
//! to a workload identity pool's token exchange endpoint (RFC 8693). The
//! token is cached in a [`SharedTokenStore`]; the [`FederatedIdentity`]
//! handle is built on the first refresh and reused until a refresh fails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::store::{Clock, Expiry, RefreshPolicy, SharedTokenStore, system_clock};
use crate::config::{IdentityConfig, SubjectTokenSource};
use crate::{Error, Result};

const TOKEN_EXCHANGE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Parameters of one token exchange call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenExchangeRequest {
    /// Token exchange endpoint
    pub token_url: String,
    /// Workload identity provider audience
    pub audience: String,
    /// Subject token type URN
    pub subject_token_type: String,
    /// The workload's own credential
    pub subject_token: String,
    /// Requested scopes
    pub scopes: Vec<String>,
}

/// Token issued by the exchange endpoint
#[derive(Clone, Deserialize)]
pub struct IssuedToken {
    /// Federated access token
    pub access_token: String,
    /// Lifetime reported by the issuer
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Token type, normally "Bearer"
    #[serde(default)]
    pub token_type: Option<String>,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Exchanges a subject token for a federated access token
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Perform one exchange
    async fn exchange(&self, request: &TokenExchangeRequest) -> Result<IssuedToken>;
}

/// Supplies the subject token presented to the exchange
#[async_trait]
pub trait SubjectTokenSupplier: Send + Sync {
    /// Read the current subject token
    async fn subject_token(&self) -> Result<String>;
}

/// RFC 8693 token exchange over HTTP
pub struct StsTokenExchange {
    http: Client,
    timeout: Duration,
}

impl StsTokenExchange {
    /// Create an exchange client with a per-call timeout
    #[must_use]
    pub fn new(http: Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }
}

#[async_trait]
impl TokenExchange for StsTokenExchange {
    async fn exchange(&self, request: &TokenExchangeRequest) -> Result<IssuedToken> {
        let scope = request.scopes.join(" ");
        let mut form = vec![
            ("grant_type", TOKEN_EXCHANGE_GRANT_TYPE),
            ("audience", request.audience.as_str()),
            ("requested_token_type", ACCESS_TOKEN_TYPE),
            ("subject_token", request.subject_token.as_str()),
            ("subject_token_type", request.subject_token_type.as_str()),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let response = self
            .http
            .post(&request.token_url)
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("Token exchange request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "Token exchange failed: HTTP {status} - {body}"
            )));
        }

        let token: IssuedToken = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("Failed to parse token exchange response: {e}")))?;
        if token.access_token.is_empty() {
            return Err(Error::Internal("Token exchange returned an empty token".into()));
        }
        Ok(token)
    }
}

/// Reads the subject token from a configured [`SubjectTokenSource`]
pub struct SubjectTokenReader {
    source: SubjectTokenSource,
    http: Client,
    timeout: Duration,
}

impl SubjectTokenReader {
    /// Create a reader for `source`
    #[must_use]
    pub fn new(source: SubjectTokenSource, http: Client, timeout: Duration) -> Self {
        Self {
            source,
            http,
            timeout,
        }
    }
}

#[async_trait]
impl SubjectTokenSupplier for SubjectTokenReader {
    async fn subject_token(&self) -> Result<String> {
        let (raw, json_field) = match &self.source {
            SubjectTokenSource::File { path, json_field } => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::Internal(format!("Cannot read subject token file {path}: {e}"))
                })?;
                (raw, json_field.as_deref())
            }
            SubjectTokenSource::Url {
                url,
                headers,
                json_field,
            } => {
                let mut request = self.http.get(url).timeout(self.timeout);
                for (name, value) in headers {
                    request = request.header(name, value);
                }
                let response = request
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(|e| Error::Internal(format!("Cannot fetch subject token: {e}")))?;
                (response.text().await?, json_field.as_deref())
            }
            SubjectTokenSource::Env { var } => {
                let raw = std::env::var(var).map_err(|_| {
                    Error::Internal(format!("Subject token variable {var} is not set"))
                })?;
                (raw, None)
            }
        };
        extract_subject_token(&raw, json_field)
    }
}

/// Pull the token out of raw source contents
fn extract_subject_token(raw: &str, json_field: Option<&str>) -> Result<String> {
    let token = match json_field {
        Some(field) => {
            let value: Value = serde_json::from_str(raw)?;
            value
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::Internal(format!("Subject token field '{field}' missing or not a string"))
                })?
        }
        None => raw.trim().to_string(),
    };
    if token.is_empty() {
        return Err(Error::Internal("Subject token is empty".into()));
    }
    Ok(token)
}

/// Long-lived federated credential handle
///
/// Built once from configuration; each [`refresh`](Self::refresh) reads a
/// fresh subject token and performs one exchange.
pub struct FederatedIdentity {
    token_url: String,
    audience: String,
    subject_token_type: String,
    scopes: Vec<String>,
    subject: Arc<dyn SubjectTokenSupplier>,
    exchange: Arc<dyn TokenExchange>,
}

impl FederatedIdentity {
    /// Construct the handle from configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the token URL or audience is unusable.
    pub fn from_config(
        config: &IdentityConfig,
        subject: Arc<dyn SubjectTokenSupplier>,
        exchange: Arc<dyn TokenExchange>,
    ) -> Result<Self> {
        Url::parse(&config.token_url)
            .map_err(|e| Error::Config(format!("Invalid token exchange URL: {e}")))?;
        if config.audience.trim().is_empty() {
            return Err(Error::Config("Workload identity audience is empty".into()));
        }

        Ok(Self {
            token_url: config.token_url.clone(),
            audience: config.audience.clone(),
            subject_token_type: config.subject_token_type.clone(),
            scopes: config.scopes.clone(),
            subject,
            exchange,
        })
    }

    /// Mint a fresh federated token
    pub async fn refresh(&self) -> Result<IssuedToken> {
        let subject_token = self.subject.subject_token().await?;
        let request = TokenExchangeRequest {
            token_url: self.token_url.clone(),
            audience: self.audience.clone(),
            subject_token_type: self.subject_token_type.clone(),
            subject_token,
            scopes: self.scopes.clone(),
        };
        debug!(token_url = %self.token_url, "Exchanging subject token");
        self.exchange.exchange(&request).await
    }
}

/// Upstream collaborators shared by everything that mints federated tokens
#[derive(Clone)]
pub struct IdentityUpstream {
    /// Subject token supplier
    pub subject: Arc<dyn SubjectTokenSupplier>,
    /// Token exchange client
    pub exchange: Arc<dyn TokenExchange>,
}

impl IdentityUpstream {
    /// HTTP-backed collaborators for `config`
    #[must_use]
    pub fn from_config(config: &IdentityConfig, http: &Client) -> Self {
        Self {
            subject: Arc::new(SubjectTokenReader::new(
                config.subject_token.clone(),
                http.clone(),
                config.timeout,
            )),
            exchange: Arc::new(StsTokenExchange::new(http.clone(), config.timeout)),
        }
    }
}

/// Cached federated identity tokens for outbound gateway calls
pub struct IdentityTokenProvider {
    config: IdentityConfig,
    upstream: IdentityUpstream,
    store: SharedTokenStore<String, FederatedIdentity>,
}

impl IdentityTokenProvider {
    /// Create a provider
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the refresh policy is invalid.
    pub fn new(config: IdentityConfig, upstream: IdentityUpstream) -> Result<Self> {
        Self::with_clock(config, upstream, system_clock())
    }

    /// Create a provider with an explicit clock
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the refresh policy is invalid.
    pub fn with_clock(config: IdentityConfig, upstream: IdentityUpstream, clock: Clock) -> Result<Self> {
        let policy = RefreshPolicy::new(config.session_duration, config.refresh_buffer)?;
        Ok(Self {
            config,
            upstream,
            store: SharedTokenStore::new("identity_token", policy, clock),
        })
    }

    /// Federated token, from cache when still valid
    pub async fn get_token(&self) -> Result<String> {
        let ttl = self.config.session_duration;
        let entry = self
            .store
            .get_or_refresh(
                "Failed to get federated identity token",
                || {
                    FederatedIdentity::from_config(
                        &self.config,
                        Arc::clone(&self.upstream.subject),
                        Arc::clone(&self.upstream.exchange),
                    )
                },
                |identity| async move {
                    let token = identity.refresh().await?;
                    // Cached for the configured lifetime regardless of what the issuer reports
                    debug!(issuer_expires_in = ?token.expires_in, ttl = ?ttl, "Federated token issued");
                    Ok((token.access_token, Expiry::After(ttl)))
                },
            )
            .await?;
        Ok(entry.value)
    }

    /// Headers for calls authenticated with the federated token
    pub async fn get_auth_headers(&self) -> Result<HeaderMap> {
        let token = self.get_token().await?;
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::auth("Federated token is not a valid header value", e))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Whether a usable token is cached
    #[must_use]
    pub fn has_valid_token(&self) -> bool {
        self.store.is_valid()
    }

    /// Drop the cached token and the credential handle
    pub async fn clear_cache(&self) {
        self.store.clear().await;
    }
}
