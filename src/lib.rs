//! Bedrock credential proxy
//!
//! Brokers between two authentication domains: a federated identity token
//! minted by a workload identity pool is exchanged for short-lived AWS
//! credentials, inbound requests are checked against a remote policy
//! gateway, and approved requests are signed and forwarded to Bedrock.
//!
//! # Features
//!
//! - **Dual credential cache**: identity token and assumed-role credentials,
//!   each with its own expiry, refresh buffer and single-flight refresh
//! - **Policy gateway**: every request is validated before it is forwarded
//! - **Credential epochs**: backend clients are rebuilt when credentials rotate
//! - **Production ready**: request ids, graceful shutdown, Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod policy_gateway;
pub mod protocol;
pub mod proxy;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// # Errors
///
/// Returns `Error::Config` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
