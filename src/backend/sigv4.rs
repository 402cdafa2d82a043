//! AWS Signature Version 4 request signing

use std::time::SystemTime;

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
use aws_sigv4::sign::v4::SigningParams;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::trace;
use url::Url;

use crate::auth::AwsCredentials;
use crate::{Error, Result};

/// RFC 3986 unreserved characters stay literal
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Percent-encode a path label or query component
#[must_use]
pub fn encode_component(input: &str) -> String {
    utf8_percent_encode(input, UNRESERVED).to_string()
}

impl From<&AwsCredentials> for Credentials {
    fn from(credentials: &AwsCredentials) -> Self {
        let session_token =
            (!credentials.session_token.is_empty()).then(|| credentials.session_token.clone());
        Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            session_token,
            None,
            "bedrock-credential-proxy",
        )
    }
}

/// Where and when a request is signed
pub struct SigningContext<'a> {
    /// Credentials to sign with
    pub credentials: &'a AwsCredentials,
    /// Signing region
    pub region: &'a str,
    /// Signing service name
    pub service: &'a str,
    /// Request time
    pub time: SystemTime,
}

/// Sign a request and return the headers to attach
///
/// `headers` must include every header that will be sent so the signature
/// covers them. The returned headers include `x-amz-date`, the
/// `authorization` header and `x-amz-security-token` when the credentials
/// carry a session token.
pub fn sign_request(
    method: &str,
    url: &Url,
    headers: &[(String, String)],
    payload: &[u8],
    context: &SigningContext<'_>,
) -> Result<Vec<(String, String)>> {
    let identity = Credentials::from(context.credentials).into();
    let params = SigningParams::builder()
        .identity(&identity)
        .region(context.region)
        .name(context.service)
        .time(context.time)
        .settings(SigningSettings::default())
        .build()
        .map_err(|e| Error::Internal(format!("Invalid signing parameters: {e}")))?
        .into();

    let signable = SignableRequest::new(
        method,
        url.as_str(),
        headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        SignableBody::Bytes(payload),
    )
    .map_err(|e| Error::Backend(format!("Request cannot be signed: {e}")))?;

    let (instructions, _signature) = sign(signable, &params)
        .map_err(|e| Error::Internal(format!("SigV4 signing failed: {e}")))?
        .into_parts();

    trace!(region = context.region, service = context.service, "Signed request");
    Ok(instructions
        .headers()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect())
}
