//! `AssumeRoleWithWebIdentity` client

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::Client;
use tracing::debug;

use crate::{Error, Result};

const STS_API_VERSION: &str = "2011-06-15";

/// One role federation call
#[derive(Clone)]
pub struct AssumeRoleRequest {
    /// Role to assume
    pub role_arn: String,
    /// Role session name
    pub session_name: String,
    /// Federated identity token presented as the web identity
    pub web_identity_token: String,
    /// Requested lifetime
    pub duration: Duration,
}

impl std::fmt::Debug for AssumeRoleRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssumeRoleRequest")
            .field("role_arn", &self.role_arn)
            .field("session_name", &self.session_name)
            .field("web_identity_token", &"<redacted>")
            .field("duration", &self.duration)
            .finish()
    }
}

/// Temporary credentials issued by STS
#[derive(Clone, PartialEq, Eq)]
pub struct AssumedRoleCredentials {
    /// Access key id (ASIA...)
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token
    pub session_token: String,
    /// Absolute expiry reported by STS
    pub expiration: DateTime<Utc>,
}

impl std::fmt::Debug for AssumedRoleCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssumedRoleCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Trades a web identity token for temporary role credentials
#[async_trait]
pub trait RoleFederation: Send + Sync {
    /// Assume the role described by `request`
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<AssumedRoleCredentials>;
}

/// STS query API client
pub struct StsClient {
    http: Client,
    endpoint: String,
    timeout: Duration,
}

impl StsClient {
    /// Create a client for `endpoint`
    #[must_use]
    pub fn new(http: Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RoleFederation for StsClient {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<AssumedRoleCredentials> {
        let duration = request.duration.as_secs().to_string();
        let form = [
            ("Action", "AssumeRoleWithWebIdentity"),
            ("Version", STS_API_VERSION),
            ("RoleArn", request.role_arn.as_str()),
            ("RoleSessionName", request.session_name.as_str()),
            ("WebIdentityToken", request.web_identity_token.as_str()),
            ("DurationSeconds", duration.as_str()),
        ];

        debug!(
            endpoint = %self.endpoint,
            role_arn = %request.role_arn,
            session_name = %request.session_name,
            "Calling AssumeRoleWithWebIdentity"
        );

        // Unsigned: the web identity token is the credential
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("STS request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Internal(format!("Failed to read STS response: {e}")))?;

        if !status.is_success() {
            let detail = parse_error(&body)
                .map_or_else(|| body.clone(), |(code, message)| format!("{code}: {message}"));
            return Err(Error::Internal(format!(
                "AssumeRoleWithWebIdentity failed: HTTP {status} - {detail}"
            )));
        }

        parse_credentials(&body)
    }
}

/// Collect text nodes as (`parent_path`, text) pairs
fn text_nodes(xml: &str) -> Result<Vec<(Vec<String>, String)>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut nodes = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                nodes.push((path.clone(), String::from_utf8_lossy(&t).into_owned()));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::Internal(format!(
                    "Malformed STS response at position {}: {e}",
                    reader.error_position()
                )));
            }
        }
    }
    Ok(nodes)
}

fn field_under<'a>(nodes: &'a [(Vec<String>, String)], parent: &str, name: &str) -> Option<&'a str> {
    nodes.iter().find_map(|(path, text)| {
        let mut tail = path.iter().rev();
        (tail.next().is_some_and(|n| n == name) && tail.next().is_some_and(|p| p == parent))
            .then_some(text.as_str())
    })
}

/// Extract credentials from an `AssumeRoleWithWebIdentityResponse`
pub(crate) fn parse_credentials(xml: &str) -> Result<AssumedRoleCredentials> {
    let nodes = text_nodes(xml)?;
    let field = |name: &str| {
        field_under(&nodes, "Credentials", name)
            .map(str::to_string)
            .ok_or_else(|| Error::Internal(format!("STS response is missing Credentials/{name}")))
    };

    let expiration = field("Expiration")?;
    let expiration = DateTime::parse_from_rfc3339(&expiration)
        .map_err(|e| Error::Internal(format!("Invalid credential expiration '{expiration}': {e}")))?
        .with_timezone(&Utc);

    Ok(AssumedRoleCredentials {
        access_key_id: field("AccessKeyId")?,
        secret_access_key: field("SecretAccessKey")?,
        session_token: field("SessionToken")?,
        expiration,
    })
}

/// Code and message of an STS `ErrorResponse`
pub(crate) fn parse_error(xml: &str) -> Option<(String, String)> {
    let nodes = text_nodes(xml).ok()?;
    let code = field_under(&nodes, "Error", "Code")?.to_string();
    let message = field_under(&nodes, "Error", "Message").unwrap_or_default().to_string();
    Some((code, message))
}
