//! Backend responses and their JSON normalization

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

/// One field of a backend response
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Binary payload
    Bytes(Bytes),
    /// Anything already representable as JSON
    Json(Value),
}

/// Shape of a backend response before normalization
#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    /// Named fields
    Fields(Vec<(String, RawValue)>),
    /// Any other JSON value
    Other(Value),
}

/// Transport details attached to every response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseMetadata {
    /// `x-amzn-requestid` of the final attempt
    pub request_id: Option<String>,
    /// HTTP status of the final attempt
    pub http_status_code: u16,
    /// Retries performed before the final attempt
    pub retry_attempts: u32,
}

fn decode(bytes: &[u8]) -> Value {
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}

/// Make a backend response JSON-serializable
///
/// Binary fields are decoded to text in place; any other JSON value passes
/// through unchanged.
#[must_use]
pub fn normalize(response: RawResponse) -> Value {
    match response {
        RawResponse::Fields(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| {
                    let value = match value {
                        RawValue::Bytes(bytes) => decode(&bytes),
                        RawValue::Json(value) => value,
                    };
                    (key, value)
                })
                .collect(),
        ),
        RawResponse::Other(value) => value,
    }
}
