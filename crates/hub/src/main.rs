//! not-my-board Hub
//!
//! Central coordinator of a board farm. Exporters register the hardware
//! they expose, agents describe what they need, and the hub brokers
//! reservations between them.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use hub::auth::{AuthPolicy, PermissiveAuth, StaticTokenAuth};
use hub::config::HubConfig;
use hub::registry::Hub;
use hub::server::{router, AppState};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "not-my-board-hub")]
#[command(author, version, about = "Board farm hub - broker access to shared hardware")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Address to bind, e.g. "[::]:2092" (overrides the config file)
    #[arg(short, long, value_name = "ADDR")]
    bind_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = HubConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    setup_logging(log_level).context("failed to setup logging")?;

    info!("not-my-board hub v{}", env!("CARGO_PKG_VERSION"));

    let auth: Arc<dyn AuthPolicy> = match &config.auth {
        Some(auth_config) => Arc::new(StaticTokenAuth::new(auth_config)),
        None => {
            warn!("authentication is disabled");
            Arc::new(PermissiveAuth)
        }
    };

    let state = Arc::new(AppState {
        hub: Arc::new(Hub::new()),
        auth,
    });

    let bind_addr = args.bind_addr.as_deref().unwrap_or(&config.bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("error waiting for Ctrl+C: {err}");
        }
        info!("received Ctrl+C, shutting down");
    })
    .await
    .context("HTTP server failed")?;

    Ok(())
}
