//! Signed Bedrock REST client for one service

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use super::ServiceKey;
use super::operations::{BodyKind, OperationSpec, ResponseKind};
use super::response::{RawResponse, RawValue, ResponseMetadata};
use super::sigv4::{SigningContext, encode_component, sign_request};
use crate::auth::{AwsCredentials, ClientConfig};
use crate::failsafe::{RetryPolicy, with_retry};
use crate::{Error, Result};

/// HTTP request derived from an operation and its payload
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PreparedRequest {
    pub(crate) path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Option<Bytes>,
}

/// Render a payload value as a plain string parameter
fn param_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Map payload fields onto path, headers, query and body
pub(crate) fn prepare(op: &OperationSpec, payload: &Map<String, Value>) -> Result<PreparedRequest> {
    let mut consumed: HashSet<&str> = HashSet::new();

    let mut path = op.path.to_string();
    for field in op.path_fields() {
        let value = payload.get(field).ok_or_else(|| {
            Error::Backend(format!(
                "Missing required parameter '{field}' for operation {}",
                op.name
            ))
        })?;
        path = path.replace(&format!("{{{field}}}"), &encode_component(&param_string(value)));
        consumed.insert(field);
    }

    let mut headers = Vec::new();
    for (field, header) in op.headers {
        if let Some(value) = payload.get(*field) {
            headers.push(((*header).to_string(), param_string(value)));
            consumed.insert(field);
        }
    }

    let mut query = Vec::new();
    for (field, name) in op.query {
        if let Some(value) = payload.get(*field) {
            query.push(((*name).to_string(), param_string(value)));
            consumed.insert(field);
        }
    }

    let body = match op.body {
        BodyKind::Empty => None,
        BodyKind::Blob(field) => {
            consumed.insert(field);
            let value = payload.get(field).ok_or_else(|| {
                Error::Backend(format!(
                    "Missing required parameter '{field}' for operation {}",
                    op.name
                ))
            })?;
            Some(Bytes::from(param_string(value)))
        }
        BodyKind::Json => {
            let rest: Map<String, Value> = payload
                .iter()
                .filter(|(k, _)| !consumed.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            consumed.extend(payload.keys().map(String::as_str));
            if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
            }
            Some(Bytes::from(serde_json::to_vec(&Value::Object(rest))?))
        }
    };

    if let Some(unknown) = payload.keys().find(|k| !consumed.contains(k.as_str())) {
        return Err(Error::Backend(format!(
            "Unknown parameter '{unknown}' for operation {}",
            op.name
        )));
    }

    Ok(PreparedRequest {
        path,
        query,
        headers,
        body,
    })
}

/// Failure of a single attempt
struct AttemptError {
    retryable: bool,
    error: Error,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

fn aws_error_message(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> String {
    let kind = headers
        .get("x-amzn-errortype")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(':').next().unwrap_or(v).to_string());
    let message = serde_json::from_slice::<Value>(body).ok().and_then(|v| {
        v.get("message")
            .or_else(|| v.get("Message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    match (kind, message) {
        (Some(kind), Some(message)) => format!("{kind} (HTTP {status}): {message}"),
        (Some(kind), None) => format!("{kind} (HTTP {status})"),
        (None, Some(message)) => format!("HTTP {status}: {message}"),
        (None, None) => format!("HTTP {status}: {}", String::from_utf8_lossy(body)),
    }
}

/// Client bound to one Bedrock service and one credential epoch
pub struct BackendClient {
    service: ServiceKey,
    endpoint: Url,
    region: String,
    credentials: AwsCredentials,
    epoch: u64,
    retry: RetryPolicy,
    timeout: Duration,
    http: Client,
}

impl fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendClient")
            .field("service", &self.service)
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.region)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl BackendClient {
    /// Build a client from live credentials
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `endpoint` is not a valid URL.
    pub fn new(
        service: ServiceKey,
        endpoint: &str,
        config: ClientConfig,
        timeout: Duration,
        http: Client,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("Invalid backend endpoint '{endpoint}': {e}")))?;
        Ok(Self {
            service,
            endpoint,
            region: config.region,
            credentials: config.credentials,
            epoch: config.epoch,
            retry: config.retry,
            timeout,
            http,
        })
    }

    /// Service this client talks to
    #[must_use]
    pub fn service(&self) -> ServiceKey {
        self.service
    }

    /// Credential epoch this client was built under
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Base endpoint
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url_for(&self, request: &PreparedRequest) -> Result<Url> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}{}", request.path))
            .map_err(|e| Error::Backend(format!("Invalid request URL: {e}")))?;
        if !request.query.is_empty() {
            let query = request
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&query));
        }
        Ok(url)
    }

    async fn attempt(
        &self,
        op: &OperationSpec,
        url: &Url,
        request: &PreparedRequest,
    ) -> std::result::Result<(StatusCode, HeaderMap, Bytes), AttemptError> {
        let body = request.body.clone().unwrap_or_default();
        let context = SigningContext {
            credentials: &self.credentials,
            region: &self.region,
            service: self.service.signing_name(),
            time: SystemTime::now(),
        };
        let signed = sign_request(op.method.as_str(), url, &request.headers, &body, &context)
            .map_err(|error| AttemptError {
                retryable: false,
                error,
            })?;

        let mut builder = self
            .http
            .request(op.method.clone(), url.clone())
            .timeout(self.timeout);
        for (name, value) in request.headers.iter().chain(signed.iter()) {
            builder = builder.header(name, value);
        }
        if request.body.is_some() {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            let kind = if e.is_timeout() { "timed out" } else { "failed" };
            AttemptError {
                retryable: true,
                error: Error::Backend(format!("{} request {kind}: {e}", self.service.service_name())),
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.bytes().await.map_err(|e| AttemptError {
            retryable: true,
            error: Error::Backend(format!("Failed to read response: {e}")),
        })?;

        if status.is_success() {
            Ok((status, headers, bytes))
        } else {
            Err(AttemptError {
                retryable: status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
                error: Error::Backend(aws_error_message(status, &headers, &bytes)),
            })
        }
    }

    /// Perform one operation with signing, timeout and retries
    ///
    /// # Errors
    ///
    /// Returns `Error::Backend` if the request cannot be built, every attempt
    /// fails, or the response cannot be decoded.
    pub async fn call(&self, op: &OperationSpec, payload: &Map<String, Value>) -> Result<RawResponse> {
        let request = prepare(op, payload)?;
        let url = self.url_for(&request)?;
        let attempts = AtomicU32::new(0);

        debug!(service = self.service.service_name(), operation = op.name, url = %url, "Calling backend");
        let result = with_retry(
            &self.retry,
            op.name,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                self.attempt(op, &url, &request)
            },
            |e: &AttemptError| e.retryable,
        )
        .await;

        let outcome = if result.is_ok() { "success" } else { "failure" };
        telemetry_metrics::counter!(
            "backend_requests_total",
            "service" => self.service.service_name(),
            "outcome" => outcome
        )
        .increment(1);

        let (status, headers, bytes) = result.map_err(|e| {
            warn!(service = self.service.service_name(), operation = op.name, error = %e, "Backend call failed");
            e.error
        })?;

        let metadata = ResponseMetadata {
            request_id: headers
                .get("x-amzn-requestid")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            http_status_code: status.as_u16(),
            retry_attempts: attempts.load(Ordering::SeqCst).saturating_sub(1),
        };
        decode_response(op, &headers, bytes, metadata)
    }
}

fn decode_response(
    op: &OperationSpec,
    headers: &HeaderMap,
    bytes: Bytes,
    metadata: ResponseMetadata,
) -> Result<RawResponse> {
    let mut fields: Vec<(String, RawValue)> = Vec::new();

    match op.response {
        ResponseKind::Json => {
            let value: Value = if bytes.is_empty() {
                Value::Object(Map::new())
            } else {
                serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Backend(format!("Invalid JSON response: {e}")))?
            };
            match value {
                Value::Object(map) => {
                    fields.extend(map.into_iter().map(|(k, v)| (k, RawValue::Json(v))));
                }
                other => return Ok(RawResponse::Other(other)),
            }
        }
        ResponseKind::Blob {
            field,
            content_type_field,
        } => {
            fields.push((field.to_string(), RawValue::Bytes(bytes)));
            if let Some(ct_field) = content_type_field {
                if let Some(ct) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
                    fields.push((ct_field.to_string(), RawValue::Json(Value::String(ct.to_string()))));
                }
            }
        }
    }

    for (header, field) in op.response_headers {
        if let Some(value) = headers.get(*header).and_then(|v| v.to_str().ok()) {
            fields.push(((*field).to_string(), RawValue::Json(Value::String(value.to_string()))));
        }
    }

    fields.push((
        "ResponseMetadata".to_string(),
        RawValue::Json(serde_json::to_value(metadata)?),
    ));
    Ok(RawResponse::Fields(fields))
}
