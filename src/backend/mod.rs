//! Backend management
//!
//! Resolves an operation name to a Bedrock service, hands out signed clients
//! bound to the current credential epoch and invokes registered operations.

pub mod client;
pub mod operations;
pub mod response;
pub mod sigv4;

pub use client::BackendClient;
pub use operations::{OperationRegistry, OperationSpec, to_snake_case};
pub use response::{RawResponse, RawValue, ResponseMetadata, normalize};

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::auth::CredentialExchanger;
use crate::config::BackendConfig;
use crate::{Error, Result};

/// Bedrock sub-service an operation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    /// Model inference (`bedrock-runtime`)
    Runtime,
    /// Agents (`bedrock-agent`)
    Agent,
    /// Control plane (`bedrock`)
    Default,
}

impl ServiceKey {
    /// Endpoint prefix and display name
    #[must_use]
    pub fn service_name(self) -> &'static str {
        match self {
            Self::Runtime => "bedrock-runtime",
            Self::Agent => "bedrock-agent",
            Self::Default => "bedrock",
        }
    }

    /// SigV4 service name; every Bedrock endpoint signs as `bedrock`
    #[must_use]
    pub fn signing_name(self) -> &'static str {
        "bedrock"
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}

/// Route an operation name to its service
///
/// Case-insensitive prefix match, first match wins: `invoke`/`stream` go to
/// the runtime, `agent` to the agent service, everything else to the control
/// plane.
#[must_use]
pub fn resolve_service(operation: &str) -> ServiceKey {
    let lower = operation.to_lowercase();
    if lower.starts_with("invoke") || lower.starts_with("stream") {
        ServiceKey::Runtime
    } else if lower.starts_with("agent") {
        ServiceKey::Agent
    } else {
        ServiceKey::Default
    }
}

/// Hands out backend clients, rebuilding them when credentials rotate
pub struct ClientFactory {
    exchanger: Arc<CredentialExchanger>,
    registry: OperationRegistry,
    config: BackendConfig,
    http: Client,
    clients: DashMap<ServiceKey, Arc<BackendClient>>,
}

impl ClientFactory {
    /// Create a factory
    #[must_use]
    pub fn new(
        exchanger: Arc<CredentialExchanger>,
        registry: OperationRegistry,
        config: BackendConfig,
        http: Client,
    ) -> Self {
        Self {
            exchanger,
            registry,
            config,
            http,
            clients: DashMap::new(),
        }
    }

    /// Operation registry
    #[must_use]
    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Base URL for a service in a region
    #[must_use]
    pub fn endpoint_for(&self, service: ServiceKey, region: &str) -> String {
        match &self.config.endpoint {
            Some(template) => template
                .replace("{service}", service.service_name())
                .replace("{region}", region),
            None => format!("https://{}.{region}.amazonaws.com", service.service_name()),
        }
    }

    /// Client for the service `operation` resolves to
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` if credentials cannot be obtained, or
    /// `Error::Config` if the endpoint is invalid.
    pub async fn get_client(&self, operation: &str) -> Result<Arc<BackendClient>> {
        let service = resolve_service(operation);
        let config = self.exchanger.get_client_config().await?;

        if let Some(client) = self.clients.get(&service) {
            if client.epoch() == config.epoch {
                debug!(service = %service, epoch = config.epoch, "Reusing backend client");
                return Ok(Arc::clone(client.value()));
            }
        }

        let endpoint = self.endpoint_for(service, &config.region);
        let epoch = config.epoch;
        let client = Arc::new(BackendClient::new(
            service,
            &endpoint,
            config,
            self.config.timeout,
            self.http.clone(),
        )?);
        self.clients.insert(service, Arc::clone(&client));
        info!(service = %service, endpoint = %endpoint, epoch, "Built backend client");
        Ok(client)
    }

    /// Invoke `operation` on `client`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidOperation` if the operation is not registered
    /// for the client's service, or `Error::Backend` if the call fails.
    pub async fn invoke(
        &self,
        client: &BackendClient,
        operation: &str,
        payload: &Map<String, Value>,
    ) -> Result<Value> {
        let name = to_snake_case(operation);
        let spec = self
            .registry
            .get(client.service(), &name)
            .ok_or_else(|| Error::InvalidOperation(operation.to_string()))?;

        let raw = client.call(spec, payload).await.map_err(|e| match e {
            Error::Backend(_) => e,
            other => Error::Backend(other.to_string()),
        })?;
        Ok(normalize(raw))
    }

    /// Number of cached clients
    #[must_use]
    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }
}
