//! Proxy request and response bodies

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Inbound `/predict` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// The wrapped backend call
    pub bedrock_api: BedrockApi,
}

/// Backend call requested by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BedrockApi {
    /// PascalCase operation name, e.g. `InvokeModel`
    pub operation: String,
    /// Operation parameters
    pub request_payload: Map<String, Value>,
    /// Caller metadata, forwarded to the policy gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RequestMetadata>,
}

/// Caller-supplied request metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    /// Correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Caller timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Caller address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    /// Caller user agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Successful `/predict` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResponse {
    /// Always "success"
    pub status: String,
    /// Operation that was invoked
    pub operation: String,
    /// Normalized backend response
    pub response: Value,
}

impl ProxyResponse {
    /// Wrap a normalized backend response
    #[must_use]
    pub fn success(operation: impl Into<String>, response: Value) -> Self {
        Self {
            status: "success".to_string(),
            operation: operation.into(),
            response,
        }
    }
}

/// Request descriptor submitted to the policy gateway
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDescriptor {
    /// PascalCase operation name
    pub operation: String,
    /// Operation parameters
    pub payload: Map<String, Value>,
    /// Caller metadata
    pub metadata: Option<RequestMetadata>,
}

impl OperationDescriptor {
    /// Gateway wire form; metadata becomes `{}` when absent
    #[must_use]
    pub fn to_gateway_payload(&self) -> Value {
        let metadata = self
            .metadata
            .as_ref()
            .and_then(|m| serde_json::to_value(m).ok())
            .unwrap_or_else(|| json!({}));
        json!({
            "operation": self.operation,
            "payload": self.payload,
            "metadata": metadata,
        })
    }
}

impl From<BedrockApi> for OperationDescriptor {
    fn from(api: BedrockApi) -> Self {
        Self {
            operation: api.operation,
            payload: api.request_payload,
            metadata: api.metadata,
        }
    }
}
