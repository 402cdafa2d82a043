//! Proxy server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::{Error, Result};

/// Credential-brokering proxy server
pub struct ProxyServer {
    /// Configuration
    config: Config,
    /// Application state, wrapped in an `Arc` when serving starts
    state: AppState,
}

impl ProxyServer {
    /// Create a new server
    ///
    /// # Errors
    ///
    /// Returns an error if a component cannot be built from `config`.
    pub fn new(config: Config) -> Result<Self> {
        let state = AppState::from_config(&config)?;
        Ok(Self { config, state })
    }

    /// Run until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or the server fails.
    pub async fn run(self) -> Result<()> {
        let Self { config, state } = self;
        let addr = SocketAddr::new(
            config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            config.server.port,
        );

        #[cfg(feature = "metrics")]
        let state = {
            let mut state = state;
            state.metrics = match metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
            {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "Failed to install Prometheus recorder, /metrics disabled");
                    None
                }
            };
            state
        };

        let app = create_router(Arc::new(state), &config.server);
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("BEDROCK CREDENTIAL PROXY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %config.server.host, port = %config.server.port, "Listening");
        info!(role_arn = %config.federation.role_arn, region = %config.federation.region, "Role federation");
        info!(
            token_url = %config.gateway_identity.token_url,
            audience = %config.gateway_identity.audience,
            "Gateway workload identity"
        );
        info!(
            token_url = %config.federation_identity.token_url,
            audience = %config.federation_identity.audience,
            "Federation workload identity"
        );
        info!(url = %config.gateway.url, timeout = ?config.gateway.timeout, "Policy gateway");
        info!(
            identity_ttl = ?config.gateway_identity.session_duration,
            credential_ttl = ?config.federation.session_duration,
            refresh_buffer = ?config.federation.refresh_buffer,
            "Credential caches"
        );
        info!("  POST http://{}:{}/predict", config.server.host, config.server.port);
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Server stopped");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal(drain: Duration) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!(drain = ?drain, "Shutdown signal received, draining connections");
    // Bound the drain: force exit if in-flight requests outlive the timeout
    tokio::spawn(async move {
        tokio::time::sleep(drain).await;
        warn!("Drain timeout elapsed, exiting");
        std::process::exit(0);
    });
}
