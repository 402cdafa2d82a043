//! Credential engine: federated identity tokens and cross-cloud credentials
//!
//! Two independent caches share the [`store`] primitives:
//!
//! - [`IdentityTokenProvider`] caches the federated identity token used to
//!   authenticate calls to the policy gateway.
//! - [`CredentialExchanger`] caches AWS credentials obtained by presenting a
//!   fresh identity token to `AssumeRoleWithWebIdentity`.

pub mod exchanger;
pub mod identity;
pub mod store;
pub mod sts;

pub use exchanger::{AwsCredentials, CachedCredentialSet, ClientConfig, CredentialExchanger, session_name};
pub use identity::{
    FederatedIdentity, IdentityTokenProvider, IdentityUpstream, StsTokenExchange, SubjectTokenReader,
    SubjectTokenSupplier, TokenExchange, TokenExchangeRequest,
};
pub use store::{CachedEntry, CachedToken, Clock, Expiry, RefreshPolicy, SharedTokenStore, TokenStore};
pub use sts::{AssumeRoleRequest, AssumedRoleCredentials, RoleFederation, StsClient};
