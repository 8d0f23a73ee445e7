use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use waav_relay::{RelaySupervisor, ServerConfig, routes, state::AppState};

/// WaaV Relay - bridges client audio to a realtime conversational service
#[derive(Parser, Debug)]
#[command(name = "waav-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    // A missing API key stops startup here, before anything is bound
    let config = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        ServerConfig::from_file(&config_path)
    } else {
        ServerConfig::from_env()
    }
    .inspect_err(|e| error!("Invalid configuration: {}", e))?;

    let address = config.address();
    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;

    let supervisor = RelaySupervisor::start(config.relay_config(), CancellationToken::new())?;

    let app = routes::create_router(AppState::new(&supervisor));

    let listener = TcpListener::bind(&socket_addr).await?;
    info!("Server listening on ws://{}/realtime", socket_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Wait for Ctrl-C, then stop the relay.
///
/// The relay closes every client session before the server stops waiting
/// for open connections.
async fn shutdown_signal(supervisor: RelaySupervisor) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received, shutting down"),
        Err(e) => error!("Failed to listen for interrupt signal: {}", e),
    }
    supervisor.shutdown().await;
}
