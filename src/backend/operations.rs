//! Operation registry
//!
//! Maps snake_case operation names to the REST shape of the call on each
//! backend service. Only the operations listed here can be invoked, and an
//! operation is only listed under the service its name routes to.

use std::collections::HashMap;

use reqwest::Method;

use super::ServiceKey;

/// Convert a PascalCase operation name to snake_case
///
/// Every uppercase character becomes `_` plus its lowercase form; a leading
/// underscore is stripped. `InvokeModel` -> `invoke_model`.
#[must_use]
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_uppercase() {
            out.push('_');
        }
        out.extend(c.to_lowercase());
    }
    out.trim_start_matches('_').to_string()
}

/// How the request body is produced from the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body
    Empty,
    /// Remaining payload fields as a JSON object
    Json,
    /// One payload field sent verbatim as the body
    Blob(&'static str),
}

/// How the response is mapped back into named fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// JSON object, fields taken as-is
    Json,
    /// Raw bytes stored under `field`; content type stored under `content_type_field`
    Blob {
        /// Field receiving the body bytes
        field: &'static str,
        /// Field receiving the Content-Type header
        content_type_field: Option<&'static str>,
    },
}

/// REST shape of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSpec {
    /// snake_case name
    pub name: &'static str,
    /// HTTP method
    pub method: Method,
    /// Path template with `{field}` placeholders filled from the payload
    pub path: &'static str,
    /// (payload field, header name)
    pub headers: &'static [(&'static str, &'static str)],
    /// (payload field, query parameter)
    pub query: &'static [(&'static str, &'static str)],
    /// Body mapping
    pub body: BodyKind,
    /// Response mapping
    pub response: ResponseKind,
    /// Response headers copied into fields: (header name, field)
    pub response_headers: &'static [(&'static str, &'static str)],
}

impl OperationSpec {
    /// Payload fields consumed by the path template
    pub fn path_fields(&self) -> impl Iterator<Item = &'static str> {
        self.path
            .split('{')
            .skip(1)
            .filter_map(|s| s.split_once('}').map(|(field, _)| field))
    }
}

const INVOKE_HEADERS: &[(&str, &str)] = &[
    ("contentType", "Content-Type"),
    ("accept", "Accept"),
    ("trace", "X-Amzn-Bedrock-Trace"),
    ("guardrailIdentifier", "X-Amzn-Bedrock-GuardrailIdentifier"),
    ("guardrailVersion", "X-Amzn-Bedrock-GuardrailVersion"),
    ("performanceConfigLatency", "X-Amzn-Bedrock-PerformanceConfig-Latency"),
];

const INVOKE_RESPONSE_HEADERS: &[(&str, &str)] = &[
    ("X-Amzn-Bedrock-PerformanceConfig-Latency", "performanceConfigLatency"),
];

fn runtime_operations() -> Vec<OperationSpec> {
    vec![
        OperationSpec {
            name: "invoke_model",
            method: Method::POST,
            path: "/model/{modelId}/invoke",
            headers: INVOKE_HEADERS,
            query: &[],
            body: BodyKind::Blob("body"),
            response: ResponseKind::Blob {
                field: "body",
                content_type_field: Some("contentType"),
            },
            response_headers: INVOKE_RESPONSE_HEADERS,
        },
        OperationSpec {
            name: "invoke_model_with_response_stream",
            method: Method::POST,
            path: "/model/{modelId}/invoke-with-response-stream",
            headers: INVOKE_HEADERS,
            query: &[],
            body: BodyKind::Blob("body"),
            response: ResponseKind::Blob {
                field: "body",
                content_type_field: Some("contentType"),
            },
            response_headers: INVOKE_RESPONSE_HEADERS,
        },
    ]
}

fn control_plane_operations() -> Vec<OperationSpec> {
    let get = |name: &'static str, path: &'static str, query: &'static [(&'static str, &'static str)]| {
        OperationSpec {
            name,
            method: Method::GET,
            path,
            headers: &[],
            query,
            body: BodyKind::Empty,
            response: ResponseKind::Json,
            response_headers: &[],
        }
    };
    let mut ops = vec![
        get(
            "list_foundation_models",
            "/foundation-models",
            &[
                ("byProvider", "byProvider"),
                ("byCustomizationType", "byCustomizationType"),
                ("byOutputModality", "byOutputModality"),
                ("byInferenceType", "byInferenceType"),
            ],
        ),
        get("get_foundation_model", "/foundation-models/{modelIdentifier}", &[]),
        get(
            "list_guardrails",
            "/guardrails",
            &[
                ("guardrailIdentifier", "guardrailIdentifier"),
                ("maxResults", "maxResults"),
                ("nextToken", "nextToken"),
            ],
        ),
        get(
            "get_guardrail",
            "/guardrails/{guardrailIdentifier}",
            &[("guardrailVersion", "guardrailVersion")],
        ),
        get(
            "list_inference_profiles",
            "/inference-profiles",
            &[
                ("maxResults", "maxResults"),
                ("nextToken", "nextToken"),
                ("typeEquals", "type"),
            ],
        ),
    ];
    ops.push(OperationSpec {
        name: "list_tags_for_resource",
        method: Method::POST,
        path: "/listTagsForResource",
        headers: &[],
        query: &[],
        body: BodyKind::Json,
        response: ResponseKind::Json,
        response_headers: &[],
    });
    ops
}

/// Operations per service, keyed by snake_case name
#[derive(Debug, Clone)]
pub struct OperationRegistry {
    services: HashMap<ServiceKey, HashMap<&'static str, OperationSpec>>,
}

impl OperationRegistry {
    /// Registry of every supported Bedrock operation
    #[must_use]
    pub fn bedrock() -> Self {
        let index = |ops: Vec<OperationSpec>| -> HashMap<&'static str, OperationSpec> {
            ops.into_iter().map(|op| (op.name, op)).collect()
        };
        let mut services = HashMap::new();
        services.insert(ServiceKey::Runtime, index(runtime_operations()));
        // No agent-service operation name starts with "agent"
        services.insert(ServiceKey::Agent, HashMap::new());
        services.insert(ServiceKey::Default, index(control_plane_operations()));
        Self { services }
    }

    /// Look up a snake_case operation on a service
    #[must_use]
    pub fn get(&self, service: ServiceKey, name: &str) -> Option<&OperationSpec> {
        self.services.get(&service).and_then(|ops| ops.get(name))
    }

    /// Sorted operation names of a service
    #[must_use]
    pub fn operations(&self, service: ServiceKey) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .services
            .get(&service)
            .map(|ops| ops.keys().copied().collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::bedrock()
    }
}
