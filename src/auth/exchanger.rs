//! Credential exchanger
//!
//! Trades a freshly minted federated identity token for short-lived AWS
//! credentials via `AssumeRoleWithWebIdentity`. The credential triple is
//! cached with the expiry STS reports; every successful refresh bumps the
//! credential epoch so that downstream clients built from older credentials
//! can be recognised and rebuilt.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::identity::{FederatedIdentity, IdentityUpstream};
use super::store::{CachedEntry, Clock, Expiry, RefreshPolicy, SharedTokenStore, system_clock};
use super::sts::{AssumeRoleRequest, RoleFederation};
use crate::config::{FederationConfig, IdentityConfig, MAX_SESSION_NAME_PREFIX_LEN};
use crate::failsafe::RetryPolicy;
use crate::{Error, Result};

/// Temporary AWS credential triple
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token
    pub session_token: String,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .finish()
    }
}

/// Cached credential triple with expiry and epoch
pub type CachedCredentialSet = CachedEntry<AwsCredentials>;

/// Everything a backend client needs to sign requests
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Signing region
    pub region: String,
    /// Credentials to sign with
    pub credentials: AwsCredentials,
    /// Expiry of `credentials`
    pub expires_at: DateTime<Utc>,
    /// Credential epoch `credentials` belong to
    pub epoch: u64,
    /// Retry policy for backend calls
    pub retry: RetryPolicy,
}

/// Role session name: `<prefix>-YYYYmmdd-HHMMSS-<8 hex>`, at most 64 chars
///
/// Overlong prefixes are shortened so the timestamp and random suffix always
/// survive.
#[must_use]
pub fn session_name(prefix: &str, now: DateTime<Utc>) -> String {
    let prefix: String = prefix.chars().take(MAX_SESSION_NAME_PREFIX_LEN).collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

/// Upstream handle: the embedded federated identity plus the STS client
pub struct RoleSession {
    identity: FederatedIdentity,
    federation: Arc<dyn RoleFederation>,
    role_arn: String,
    session_prefix: String,
    duration: std::time::Duration,
}

impl RoleSession {
    fn from_config(
        identity: &IdentityConfig,
        federation: &FederationConfig,
        upstream: &IdentityUpstream,
        sts: Arc<dyn RoleFederation>,
    ) -> Result<Self> {
        if !federation.role_arn.starts_with("arn:") {
            return Err(Error::Config(format!(
                "Invalid role ARN: '{}'",
                federation.role_arn
            )));
        }
        Ok(Self {
            identity: FederatedIdentity::from_config(
                identity,
                Arc::clone(&upstream.subject),
                Arc::clone(&upstream.exchange),
            )?,
            federation: sts,
            role_arn: federation.role_arn.clone(),
            session_prefix: federation.session_name_prefix.clone(),
            duration: federation.session_duration,
        })
    }

    async fn assume(&self, now: DateTime<Utc>) -> Result<(AwsCredentials, Expiry)> {
        let token = self.identity.refresh().await?;
        let request = AssumeRoleRequest {
            role_arn: self.role_arn.clone(),
            session_name: session_name(&self.session_prefix, now),
            web_identity_token: token.access_token,
            duration: self.duration,
        };
        let issued = self.federation.assume_role(&request).await?;
        let credentials = AwsCredentials {
            access_key_id: issued.access_key_id,
            secret_access_key: issued.secret_access_key,
            session_token: issued.session_token,
        };
        if credentials.access_key_id.is_empty()
            || credentials.secret_access_key.is_empty()
            || credentials.session_token.is_empty()
        {
            return Err(Error::Internal("STS returned an incomplete credential set".into()));
        }
        Ok((credentials, Expiry::At(issued.expiration)))
    }
}

/// Cached cross-cloud credentials
pub struct CredentialExchanger {
    identity: IdentityConfig,
    federation: FederationConfig,
    retry: RetryPolicy,
    upstream: IdentityUpstream,
    sts: Arc<dyn RoleFederation>,
    store: SharedTokenStore<AwsCredentials, RoleSession>,
}

impl CredentialExchanger {
    /// Create an exchanger
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the refresh policy is invalid.
    pub fn new(
        identity: IdentityConfig,
        federation: FederationConfig,
        retry: RetryPolicy,
        upstream: IdentityUpstream,
        sts: Arc<dyn RoleFederation>,
    ) -> Result<Self> {
        Self::with_clock(identity, federation, retry, upstream, sts, system_clock())
    }

    /// Create an exchanger with an explicit clock
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the refresh policy is invalid.
    pub fn with_clock(
        identity: IdentityConfig,
        federation: FederationConfig,
        retry: RetryPolicy,
        upstream: IdentityUpstream,
        sts: Arc<dyn RoleFederation>,
        clock: Clock,
    ) -> Result<Self> {
        let policy = RefreshPolicy::new(federation.session_duration, federation.refresh_buffer)?;
        Ok(Self {
            identity,
            federation,
            retry,
            upstream,
            sts,
            store: SharedTokenStore::new("aws_credentials", policy, clock),
        })
    }

    /// Configured region
    #[must_use]
    pub fn region(&self) -> &str {
        &self.federation.region
    }

    /// Credentials, from cache when still valid
    pub async fn get_credentials(&self) -> Result<CachedCredentialSet> {
        let now = self.store.now();
        self.store
            .get_or_refresh(
                "Failed to get AWS credentials",
                || {
                    RoleSession::from_config(
                        &self.identity,
                        &self.federation,
                        &self.upstream,
                        Arc::clone(&self.sts),
                    )
                },
                |session| async move { session.assume(now).await },
            )
            .await
    }

    /// Region, live credentials and retry policy for a backend client
    pub async fn get_client_config(&self) -> Result<ClientConfig> {
        let set = self.get_credentials().await?;
        Ok(ClientConfig {
            region: self.federation.region.clone(),
            credentials: set.value,
            expires_at: set.expires_at,
            epoch: set.epoch,
            retry: self.retry.clone(),
        })
    }

    /// Epoch of the most recent successful refresh
    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.store.epoch()
    }

    /// Whether usable credentials are cached
    #[must_use]
    pub fn has_valid_credentials(&self) -> bool {
        self.store.is_valid()
    }

    /// Drop cached credentials and the role session handle
    pub async fn clear_cache(&self) {
        self.store.clear().await;
    }
}
