//! End-to-end tests: real components wired from config against mock upstreams

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bedrock_credential_proxy::config::{Config, SubjectTokenSource};
use bedrock_credential_proxy::proxy::{AppState, create_router};
use chrono::{SecondsFormat, Utc};
use mockito::{Matcher, Mock, Server, ServerGuard};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::NamedTempFile;
use tower::ServiceExt;

const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/bedrock-invoker";
const GATEWAY_AUDIENCE: &str =
    "//iam.googleapis.com/projects/1/locations/global/workloadIdentityPools/pool/providers/gateway";
const FEDERATION_AUDIENCE: &str =
    "//iam.googleapis.com/projects/1/locations/global/workloadIdentityPools/pool/providers/aws";

/// Mock upstreams shared by one test
struct Upstreams {
    identity: ServerGuard,
    sts: ServerGuard,
    gateway: ServerGuard,
    backend: ServerGuard,
    _subject: NamedTempFile,
    config: Config,
}

async fn upstreams() -> Upstreams {
    let identity = Server::new_async().await;
    let sts = Server::new_async().await;
    let gateway = Server::new_async().await;
    let backend = Server::new_async().await;

    let mut subject = NamedTempFile::new().unwrap();
    write!(subject, "subject-jwt").unwrap();

    let mut config = Config::default();
    for (section, audience) in [
        (&mut config.gateway_identity, GATEWAY_AUDIENCE),
        (&mut config.federation_identity, FEDERATION_AUDIENCE),
    ] {
        section.token_url = format!("{}/v1/token", identity.url());
        section.audience = audience.to_string();
        section.subject_token = SubjectTokenSource::File {
            path: subject.path().display().to_string(),
            json_field: None,
        };
    }
    config.federation.role_arn = ROLE_ARN.to_string();
    config.federation.region = "eu-west-1".to_string();
    config.federation.sts_endpoint = Some(format!("{}/", sts.url()));
    config.gateway.url = format!("{}/validate", gateway.url());
    config.gateway.timeout = Duration::from_secs(5);
    config.backend.endpoint = Some(backend.url());
    config.backend.max_attempts = 1;
    config.validate().unwrap();

    Upstreams {
        identity,
        sts,
        gateway,
        backend,
        _subject: subject,
        config,
    }
}

impl Upstreams {
    /// Token exchange for `audience` answering with `token` (not yet created)
    fn identity_token(&mut self, mut matchers: Vec<Matcher>, token: &str) -> Mock {
        matchers.extend([
            Matcher::UrlEncoded(
                "grant_type".into(),
                "urn:ietf:params:oauth:grant-type:token-exchange".into(),
            ),
            Matcher::UrlEncoded("subject_token".into(), "subject-jwt".into()),
        ]);
        self.identity
            .mock("POST", "/v1/token")
            .match_body(Matcher::AllOf(matchers))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"access_token": token, "expires_in": 3600, "token_type": "Bearer"}).to_string())
    }

    /// Token minted by the gateway identity, with the cloud-platform scope
    fn gateway_token(&mut self) -> Mock {
        self.identity_token(
            vec![
                Matcher::UrlEncoded("audience".into(), GATEWAY_AUDIENCE.into()),
                Matcher::UrlEncoded(
                    "scope".into(),
                    "https://www.googleapis.com/auth/cloud-platform".into(),
                ),
            ],
            "gateway-token",
        )
    }

    /// Token minted by the federation identity and presented to STS
    fn federation_token(&mut self) -> Mock {
        self.identity_token(
            vec![Matcher::UrlEncoded("audience".into(), FEDERATION_AUDIENCE.into())],
            "web-identity-token",
        )
    }

    fn sts_ok(&mut self) -> Mock {
        let expiration = (Utc::now() + chrono::Duration::hours(1))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let body = format!(
            r#"<AssumeRoleWithWebIdentityResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
  <AssumeRoleWithWebIdentityResult>
    <Credentials>
      <SessionToken>session-token-1</SessionToken>
      <SecretAccessKey>secret-key-1</SecretAccessKey>
      <Expiration>{expiration}</Expiration>
      <AccessKeyId>ASIAEXAMPLE1</AccessKeyId>
    </Credentials>
  </AssumeRoleWithWebIdentityResult>
</AssumeRoleWithWebIdentityResponse>"#
        );
        self.sts
            .mock("POST", "/")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("Action".into(), "AssumeRoleWithWebIdentity".into()),
                Matcher::UrlEncoded("RoleArn".into(), ROLE_ARN.into()),
                Matcher::UrlEncoded("WebIdentityToken".into(), "web-identity-token".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "text/xml")
            .with_body(body)
    }

    fn verdict(&mut self, status: &str) -> Mock {
        self.gateway
            .mock("POST", "/validate")
            .match_header("authorization", "Bearer gateway-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "status": status }).to_string())
    }

    fn router(&self) -> axum::Router {
        let state = AppState::from_config(&self.config).unwrap();
        create_router(Arc::new(state), &self.config.server)
    }
}

async fn predict(router: axum::Router, body: &Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn invoke_model() -> Value {
    json!({
        "bedrock_api": {
            "operation": "InvokeModel",
            "request_payload": {
                "modelId": "anthropic.claude-v2",
                "body": "{\"prompt\":\"Hello\"}"
            },
            "metadata": {"requestId": "req-1", "sourceIp": "10.0.0.1"}
        }
    })
}

#[tokio::test]
async fn approved_request_flows_through_both_credential_caches() {
    let mut up = upstreams().await;
    // One token per identity, each cached across both requests
    let gateway_token = up.gateway_token().expect(1).create_async().await;
    let federation_token = up.federation_token().expect(1).create_async().await;
    let sts = up.sts_ok().expect(1).create_async().await;
    let gateway = up.verdict("approved").expect(2).create_async().await;
    let backend = up
        .backend
        .mock("POST", "/model/anthropic.claude-v2/invoke")
        .match_header(
            "authorization",
            Matcher::Regex(
                r"^AWS4-HMAC-SHA256 Credential=ASIAEXAMPLE1/\d{8}/eu-west-1/bedrock/aws4_request, SignedHeaders=\S+, Signature=[0-9a-f]{64}$"
                    .into(),
            ),
        )
        .match_header("x-amz-security-token", "session-token-1")
        .match_body(Matcher::Exact(r#"{"prompt":"Hello"}"#.into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"completion":" Hello there"}"#)
        .expect(2)
        .create_async()
        .await;

    let router = up.router();
    for _ in 0..2 {
        let (status, body) = predict(router.clone(), &invoke_model()).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["status"], "success");
        assert_eq!(body["operation"], "InvokeModel");
        assert_eq!(body["response"]["body"], r#"{"completion":" Hello there"}"#);
        assert_eq!(body["response"]["ResponseMetadata"]["HttpStatusCode"], 200);
    }

    gateway_token.assert_async().await;
    federation_token.assert_async().await;
    // Second request reuses the cached credential set
    sts.assert_async().await;
    gateway.assert_async().await;
    backend.assert_async().await;
}

#[tokio::test]
async fn denied_request_returns_403_without_touching_aws() {
    let mut up = upstreams().await;
    let _gateway_token = up.gateway_token().create_async().await;
    let federation_token = up.federation_token().expect(0).create_async().await;
    let gateway = up.verdict("denied").create_async().await;
    let sts = up.sts.mock("POST", Matcher::Any).expect(0).create_async().await;
    let backend = up
        .backend
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let (status, body) = predict(up.router(), &invoke_model()).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body["detail"],
        "Request not approved by policy gateway (status: denied)"
    );
    gateway.assert_async().await;
    federation_token.assert_async().await;
    sts.assert_async().await;
    backend.assert_async().await;
}

#[tokio::test]
async fn unknown_operation_returns_400() {
    let mut up = upstreams().await;
    let _gateway_token = up.gateway_token().create_async().await;
    let _federation_token = up.federation_token().create_async().await;
    let _sts = up.sts_ok().create_async().await;
    let _gateway = up.verdict("approved").create_async().await;

    let (status, body) = predict(
        up.router(),
        &json!({"bedrock_api": {"operation": "InvalidOp", "request_payload": {}}}),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Invalid Bedrock operation: InvalidOp");
}

#[tokio::test]
async fn sts_rejection_surfaces_as_auth_failure() {
    let mut up = upstreams().await;
    let _gateway_token = up.gateway_token().create_async().await;
    let _federation_token = up.federation_token().create_async().await;
    let _gateway = up.verdict("approved").create_async().await;
    let _sts = up.sts
        .mock("POST", "/")
        .with_status(403)
        .with_header("content-type", "text/xml")
        .with_body(
            r#"<ErrorResponse><Error><Type>Sender</Type><Code>AccessDenied</Code><Message>Not authorized to perform sts:AssumeRoleWithWebIdentity</Message></Error></ErrorResponse>"#,
        )
        .create_async()
        .await;

    let (status, body) = predict(up.router(), &invoke_model()).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.starts_with("Authentication failed"), "{detail}");
    assert!(detail.contains("AccessDenied"), "{detail}");
}

#[tokio::test]
async fn identity_pool_outage_fails_closed() {
    let mut up = upstreams().await;
    let _identity = up.identity
        .mock("POST", "/v1/token")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;
    let gateway = up
        .gateway
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let (status, body) = predict(up.router(), &invoke_model()).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"].as_str().unwrap().contains("federated identity token"));
    gateway.assert_async().await;
}

#[tokio::test]
async fn backend_error_is_reported_as_500() {
    let mut up = upstreams().await;
    let _gateway_token = up.gateway_token().create_async().await;
    let _federation_token = up.federation_token().create_async().await;
    let _sts = up.sts_ok().create_async().await;
    let _gateway = up.verdict("approved").create_async().await;
    let _backend = up.backend
        .mock("POST", "/model/anthropic.claude-v2/invoke")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"Malformed input request"}"#)
        .create_async()
        .await;

    let (status, body) = predict(up.router(), &invoke_model()).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.starts_with("Error calling Bedrock service"), "{detail}");
    assert!(detail.contains("Malformed input request"), "{detail}");
}
