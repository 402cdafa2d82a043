//! Bedrock credential proxy

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use bedrock_credential_proxy::{
    cli::{Cli, Command},
    config::Config,
    proxy::ProxyServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::CheckConfig) => {
            println!("Configuration OK");
            println!("  role:     {}", config.federation.role_arn);
            println!("  region:   {}", config.federation.region);
            println!("  gateway identity pool:    {}", config.gateway_identity.token_url);
            println!("  federation identity pool: {}", config.federation_identity.token_url);
            println!("  gateway:  {}", config.gateway.url);
            ExitCode::SUCCESS
        }
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> bedrock_credential_proxy::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    Ok(config)
}

/// Run the proxy server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting credential proxy"
    );

    let server = match ProxyServer::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create proxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Proxy error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Proxy shutdown complete");
    ExitCode::SUCCESS
}
