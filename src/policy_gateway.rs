//! Policy gateway validation
//!
//! Every inbound request is described to a remote policy gateway before it
//! reaches the backend. The call is authenticated with the federated identity
//! token; anything other than an explicit `approved` verdict stops the
//! request.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::IdentityTokenProvider;
use crate::config::GatewayConfig;
use crate::protocol::OperationDescriptor;
use crate::{Error, Result};

/// Verdict status reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictStatus {
    /// Request may proceed
    Approved,
    /// Request rejected by policy
    Denied,
    /// Gateway could not decide, or reported something unrecognised
    Error,
}

impl VerdictStatus {
    /// Parse a status string; unknown values become `Error`
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status {
            "approved" => Self::Approved,
            "denied" => Self::Denied,
            _ => Self::Error,
        }
    }

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }
}

/// Gateway decision for one request
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayVerdict {
    /// Parsed status
    pub status: VerdictStatus,
    /// Full response body
    pub raw: Value,
}

impl GatewayVerdict {
    /// Build a verdict from a gateway response body
    #[must_use]
    pub fn from_body(raw: Value) -> Self {
        let status = raw
            .get("status")
            .and_then(Value::as_str)
            .map_or(VerdictStatus::Error, VerdictStatus::parse);
        Self { status, raw }
    }
}

/// Submits request descriptors to the policy gateway
pub struct GatewayValidator {
    http: Client,
    url: String,
    timeout: Duration,
    identity: Arc<IdentityTokenProvider>,
}

impl GatewayValidator {
    /// Create a validator
    #[must_use]
    pub fn new(config: &GatewayConfig, http: Client, identity: Arc<IdentityTokenProvider>) -> Self {
        Self {
            http,
            url: config.url.clone(),
            timeout: config.timeout,
            identity,
        }
    }

    /// Ask the gateway whether `descriptor` may proceed
    ///
    /// # Errors
    ///
    /// - `Error::Auth` if no identity token could be obtained
    /// - `Error::Gateway` on transport failure, timeout, non-2xx or an
    ///   unparseable body
    /// - `Error::AuthorizationDenied` for any verdict other than `approved`
    pub async fn validate(&self, descriptor: &OperationDescriptor) -> Result<GatewayVerdict> {
        let headers = self.identity.get_auth_headers().await?;

        debug!(operation = %descriptor.operation, url = %self.url, "Validating with policy gateway");
        let response = self
            .http
            .post(&self.url)
            .headers(headers)
            .timeout(self.timeout)
            .json(&descriptor.to_gateway_payload())
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() { "timed out" } else { "unreachable" };
                Error::Gateway(format!("gateway {kind}: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Policy gateway returned an error status");
            return Err(Error::Gateway(format!("HTTP {status} - {body}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Gateway(format!("unparseable gateway response: {e}")))?;
        let verdict = GatewayVerdict::from_body(body);

        telemetry_metrics::counter!("gateway_verdict_total", "status" => verdict.status.as_str())
            .increment(1);

        if verdict.status != VerdictStatus::Approved {
            warn!(
                operation = %descriptor.operation,
                status = verdict.status.as_str(),
                "Request not approved by policy gateway"
            );
            return Err(Error::AuthorizationDenied {
                status: verdict.status.as_str().to_string(),
                verdict: verdict.raw,
            });
        }

        debug!(operation = %descriptor.operation, "Request approved");
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use mockito::Matcher;
    use pretty_assertions::assert_eq;
    use serde_json::{Map, json};

    use super::*;
    use crate::auth::identity::test_support::{CountingExchange, upstream};
    use crate::config::IdentityConfig;

    fn identity(exchange: Arc<CountingExchange>) -> Arc<IdentityTokenProvider> {
        let config = IdentityConfig {
            token_url: "https://sts.googleapis.com/v1/token".into(),
            audience: "aud".into(),
            ..Default::default()
        };
        Arc::new(IdentityTokenProvider::new(config, upstream(exchange)).unwrap())
    }

    fn validator(url: String, exchange: Arc<CountingExchange>) -> GatewayValidator {
        let config = GatewayConfig {
            url,
            timeout: Duration::from_secs(2),
        };
        GatewayValidator::new(&config, Client::new(), identity(exchange))
    }

    fn descriptor() -> OperationDescriptor {
        let mut payload = Map::new();
        payload.insert("modelId".into(), json!("anthropic.claude-v2"));
        OperationDescriptor {
            operation: "InvokeModel".into(),
            payload,
            metadata: None,
        }
    }

    /// Accepts connections and never answers
    async fn silent_upstream() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn silent_gateway_times_out_as_bad_gateway() {
        let config = GatewayConfig {
            url: format!("{}/validate", silent_upstream().await),
            timeout: Duration::from_millis(200),
        };
        let validator =
            GatewayValidator::new(&config, Client::new(), identity(Arc::new(CountingExchange::default())));

        let started = std::time::Instant::now();
        let err = validator.validate(&descriptor()).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, Error::Gateway(ref m) if m.contains("timed out")), "{err}");
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn unknown_status_is_error() {
        assert_eq!(VerdictStatus::parse("approved"), VerdictStatus::Approved);
        assert_eq!(VerdictStatus::parse("denied"), VerdictStatus::Denied);
        assert_eq!(VerdictStatus::parse("maybe"), VerdictStatus::Error);
        assert_eq!(
            GatewayVerdict::from_body(json!({"reason": "no status"})).status,
            VerdictStatus::Error
        );
    }

    #[tokio::test]
    async fn approved_verdict_is_returned() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/validate")
            .match_header("authorization", "Bearer federated-1")
            .match_body(Matcher::Json(json!({
                "operation": "InvokeModel",
                "payload": {"modelId": "anthropic.claude-v2"},
                "metadata": {}
            })))
            .with_status(200)
            .with_body(r#"{"status":"approved","policy":"default"}"#)
            .create_async()
            .await;

        let v = validator(format!("{}/validate", server.url()), Arc::new(CountingExchange::default()));
        let verdict = v.validate(&descriptor()).await.unwrap();
        assert_eq!(verdict.status, VerdictStatus::Approved);
        assert_eq!(verdict.raw["policy"], "default");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn denied_verdict_maps_to_authorization_denied() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/validate")
            .with_status(200)
            .with_body(r#"{"status":"denied","reason":"model not allowed"}"#)
            .create_async()
            .await;

        let v = validator(format!("{}/validate", server.url()), Arc::new(CountingExchange::default()));
        let err = v.validate(&descriptor()).await.unwrap_err();
        match err {
            Error::AuthorizationDenied { status, verdict } => {
                assert_eq!(status, "denied");
                assert_eq!(verdict["reason"], "model not allowed");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_2xx_is_gateway_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/validate")
            .with_status(503)
            .with_body("upstream busy")
            .create_async()
            .await;

        let v = validator(format!("{}/validate", server.url()), Arc::new(CountingExchange::default()));
        let err = v.validate(&descriptor()).await.unwrap_err();
        assert!(matches!(err, Error::Gateway(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn unparseable_body_is_gateway_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/validate")
            .with_status(200)
            .with_body("<html>ok</html>")
            .create_async()
            .await;

        let v = validator(format!("{}/validate", server.url()), Arc::new(CountingExchange::default()));
        let err = v.validate(&descriptor()).await.unwrap_err();
        assert!(matches!(err, Error::Gateway(_)));
    }

    #[tokio::test]
    async fn identity_failure_is_auth_error_without_gateway_call() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/validate").expect(0).create_async().await;

        let exchange = Arc::new(CountingExchange::default());
        exchange.fail.store(true, Ordering::SeqCst);
        let v = validator(format!("{}/validate", server.url()), exchange);
        let err = v.validate(&descriptor()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_gateway_is_gateway_error() {
        // Nothing listens on port 9 on loopback
        let v = validator("http://127.0.0.1:9/validate".into(), Arc::new(CountingExchange::default()));
        let err = v.validate(&descriptor()).await.unwrap_err();
        assert!(matches!(err, Error::Gateway(_)));
    }
}
