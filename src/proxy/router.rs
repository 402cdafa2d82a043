//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use reqwest::Client;
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::auth::{CredentialExchanger, IdentityTokenProvider, IdentityUpstream, StsClient};
use crate::backend::{ClientFactory, OperationRegistry};
use crate::config::{Config, ServerConfig};
use crate::failsafe::RetryPolicy;
use crate::policy_gateway::GatewayValidator;
use crate::protocol::{OperationDescriptor, ProxyRequest, ProxyResponse};
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Federated identity tokens for gateway calls
    pub identity: Arc<IdentityTokenProvider>,
    /// Policy gateway client
    pub validator: Arc<GatewayValidator>,
    /// Cross-cloud credential cache
    pub exchanger: Arc<CredentialExchanger>,
    /// Backend client factory
    pub factory: Arc<ClientFactory>,
    /// Prometheus handle, when a recorder was installed
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl AppState {
    /// Assemble state from already-built components
    #[must_use]
    pub fn new(
        identity: Arc<IdentityTokenProvider>,
        validator: Arc<GatewayValidator>,
        exchanger: Arc<CredentialExchanger>,
        factory: Arc<ClientFactory>,
    ) -> Self {
        Self {
            identity,
            validator,
            exchanger,
            factory,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Wire every component against the real upstream endpoints
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or a refresh
    /// policy is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("bedrock-credential-proxy/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let identity = Arc::new(IdentityTokenProvider::new(
            config.gateway_identity.clone(),
            IdentityUpstream::from_config(&config.gateway_identity, &http),
        )?);
        let sts = Arc::new(StsClient::new(
            http.clone(),
            config.federation.sts_url(),
            config.federation.timeout,
        ));
        let exchanger = Arc::new(CredentialExchanger::new(
            config.federation_identity.clone(),
            config.federation.clone(),
            RetryPolicy::new(&config.backend),
            IdentityUpstream::from_config(&config.federation_identity, &http),
            sts,
        )?);
        let validator = Arc::new(GatewayValidator::new(
            &config.gateway,
            http.clone(),
            Arc::clone(&identity),
        ));
        let factory = Arc::new(ClientFactory::new(
            Arc::clone(&exchanger),
            OperationRegistry::bedrock(),
            config.backend.clone(),
            http,
        ));

        Ok(Self::new(identity, validator, exchanger, factory))
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/predict", post(predict_handler));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router
        .layer(DefaultBodyLimit::max(server.max_body_size))
        .layer(TimeoutLayer::new(server.request_timeout))
        .layer(CatchPanicLayer::new())
        .layer(CorsLayer::permissive())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "message": "Bedrock Generic Proxy Service"
    }))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    debug!(
        identity_cached = state.identity.has_valid_token(),
        credentials_cached = state.exchanger.has_valid_credentials(),
        epoch = state.exchanger.current_epoch(),
        "Readiness check"
    );
    Json(json!({ "status": "ready" }))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}

/// Validate with the policy gateway, then forward to Bedrock
async fn predict_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: std::result::Result<Json<ProxyRequest>, JsonRejection>,
) -> std::result::Result<Json<ProxyResponse>, Error> {
    let Json(request) = body.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "Rejected malformed request body");
        Error::BadRequest(rejection.body_text())
    })?;

    let mut api = request.bedrock_api;
    let metadata = api.metadata.get_or_insert_with(Default::default);
    if metadata.request_id.is_none() {
        metadata.request_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }

    let descriptor = OperationDescriptor::from(api);
    let operation = descriptor.operation.clone();
    info!(operation = %operation, "Processing request");

    let result = forward(&state, &descriptor).await;
    match result {
        Ok(response) => Ok(Json(ProxyResponse::success(operation, response))),
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() {
                error!(operation = %operation, status = %status, error = %e, "Request failed");
            } else {
                warn!(operation = %operation, status = %status, error = %e, "Request rejected");
            }
            Err(e)
        }
    }
}

async fn forward(state: &AppState, descriptor: &OperationDescriptor) -> Result<serde_json::Value> {
    state.validator.validate(descriptor).await?;
    let client = state.factory.get_client(&descriptor.operation).await?;
    state
        .factory
        .invoke(&client, &descriptor.operation, &descriptor.payload)
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use axum::body::Body;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::exchanger::test_support::{FakeSts, sts};
    use crate::auth::identity::test_support::{CountingExchange, upstream};
    use crate::config::{BackendConfig, FederationConfig, GatewayConfig, IdentityConfig};

    struct Fixture {
        sts: Arc<FakeSts>,
        router: Router,
    }

    fn fixture(gateway_url: String, backend_url: String) -> Fixture {
        let identity_config = IdentityConfig {
            token_url: "https://sts.googleapis.com/v1/token".into(),
            audience: "aud".into(),
            ..Default::default()
        };
        let fake = Arc::new(FakeSts::new(chrono::Utc::now() + chrono::Duration::hours(1)));
        let exchange = Arc::new(CountingExchange::default());

        let identity = Arc::new(
            IdentityTokenProvider::new(identity_config.clone(), upstream(Arc::clone(&exchange))).unwrap(),
        );
        let exchanger = Arc::new(
            CredentialExchanger::new(
                identity_config,
                FederationConfig {
                    role_arn: "arn:aws:iam::123456789012:role/bedrock".into(),
                    ..Default::default()
                },
                RetryPolicy::default(),
                upstream(exchange),
                sts(&fake),
            )
            .unwrap(),
        );
        let validator = Arc::new(GatewayValidator::new(
            &GatewayConfig {
                url: gateway_url,
                ..Default::default()
            },
            Client::new(),
            Arc::clone(&identity),
        ));
        let factory = Arc::new(ClientFactory::new(
            Arc::clone(&exchanger),
            OperationRegistry::bedrock(),
            BackendConfig {
                endpoint: Some(backend_url),
                max_attempts: 1,
                ..Default::default()
            },
            Client::new(),
        ));

        let state = Arc::new(AppState::new(identity, validator, exchanger, factory));
        Fixture {
            sts: fake,
            router: create_router(state, &ServerConfig::default()),
        }
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    fn predict(body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/predict")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoints_report_status() {
        let f = fixture("http://127.0.0.1:9/validate".into(), "http://127.0.0.1:9".into());

        let (status, headers, body) = send(
            f.router.clone(),
            Request::get("/").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "message": "Bedrock Generic Proxy Service"}));
        assert!(headers.contains_key("x-request-id"));

        let (_, _, body) = send(f.router.clone(), Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(body, json!({"status": "healthy"}));

        let (_, _, body) = send(f.router, Request::get("/ready").body(Body::empty()).unwrap()).await;
        assert_eq!(body, json!({"status": "ready"}));
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let f = fixture("http://127.0.0.1:9/validate".into(), "http://127.0.0.1:9".into());
        let (status, _, body) = send(f.router, predict(&json!({"operation": "InvokeModel"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().starts_with("Invalid request"));
    }

    #[tokio::test]
    async fn denied_request_never_reaches_backend() {
        let mut gateway = mockito::Server::new_async().await;
        let _gateway = gateway
            .mock("POST", "/validate")
            .with_status(200)
            .with_body(r#"{"status":"denied"}"#)
            .create_async()
            .await;
        let mut backend = mockito::Server::new_async().await;
        let backend_mock = backend
            .mock("POST", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let f = fixture(format!("{}/validate", gateway.url()), backend.url());
        let (status, _, body) = send(
            f.router,
            predict(&json!({"bedrock_api": {"operation": "InvokeModel", "request_payload": {"modelId": "m", "body": "{}"}}})),
        )
        .await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["detail"].as_str().unwrap().contains("not approved"));
        assert_eq!(f.sts.calls.load(Ordering::SeqCst), 0);
        backend_mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_request_payload_is_bad_request() {
        let f = fixture("http://127.0.0.1:9/validate".into(), "http://127.0.0.1:9".into());
        let (status, _, body) = send(
            f.router,
            predict(&json!({"bedrock_api": {"operation": "ListFoundationModels"}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("request_payload"));
    }

    #[tokio::test]
    async fn request_id_is_filled_when_metadata_is_absent() {
        let mut gateway = mockito::Server::new_async().await;
        let gateway_mock = gateway
            .mock("POST", "/validate")
            .match_body(mockito::Matcher::PartialJson(json!({
                "operation": "ListFoundationModels",
                "metadata": {"requestId": "generated-id"}
            })))
            .with_status(200)
            .with_body(r#"{"status":"denied"}"#)
            .create_async()
            .await;

        let f = fixture(format!("{}/validate", gateway.url()), "http://127.0.0.1:9".into());
        let mut request = predict(
            &json!({"bedrock_api": {"operation": "ListFoundationModels", "request_payload": {}}}),
        );
        request
            .headers_mut()
            .insert("x-request-id", "generated-id".parse().unwrap());
        let (status, _, _) = send(f.router, request).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        gateway_mock.assert_async().await;
    }

    #[tokio::test]
    async fn unknown_operation_is_bad_request() {
        let mut gateway = mockito::Server::new_async().await;
        let _gateway = gateway
            .mock("POST", "/validate")
            .with_status(200)
            .with_body(r#"{"status":"approved"}"#)
            .create_async()
            .await;

        let f = fixture(format!("{}/validate", gateway.url()), "http://127.0.0.1:9".into());
        let (status, _, body) = send(
            f.router,
            predict(&json!({"bedrock_api": {"operation": "InvalidOp", "request_payload": {}}})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "Invalid Bedrock operation: InvalidOp");
    }

    #[tokio::test]
    async fn gateway_outage_is_bad_gateway() {
        let f = fixture("http://127.0.0.1:9/validate".into(), "http://127.0.0.1:9".into());
        let (status, _, _) = send(
            f.router,
            predict(&json!({"bedrock_api": {"operation": "ListFoundationModels", "request_payload": {}}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn approved_request_is_forwarded() {
        let mut gateway = mockito::Server::new_async().await;
        let gateway_mock = gateway
            .mock("POST", "/validate")
            .match_body(mockito::Matcher::PartialJson(json!({
                "operation": "InvokeModel",
                "metadata": {"requestId": "from-header"}
            })))
            .with_status(200)
            .with_body(r#"{"status":"approved"}"#)
            .create_async()
            .await;
        let mut backend = mockito::Server::new_async().await;
        let _backend = backend
            .mock("POST", "/model/anthropic.claude-v2/invoke")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"completion":" Hi"}"#)
            .create_async()
            .await;

        let f = fixture(format!("{}/validate", gateway.url()), backend.url());
        let mut request = predict(&json!({
            "bedrock_api": {
                "operation": "InvokeModel",
                "request_payload": {"modelId": "anthropic.claude-v2", "body": "{\"prompt\":\"Hello\"}"},
                "metadata": {"sourceIp": "10.1.2.3"}
            }
        }));
        request
            .headers_mut()
            .insert("x-request-id", "from-header".parse().unwrap());
        let (status, headers, body) = send(f.router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-request-id").unwrap(), "from-header");
        assert_eq!(body["status"], "success");
        assert_eq!(body["operation"], "InvokeModel");
        assert_eq!(body["response"]["body"], r#"{"completion":" Hi"}"#);
        gateway_mock.assert_async().await;
    }
}
