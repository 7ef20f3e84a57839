//! ServerOps gateway daemon
//!
//! Serves the WebSocket endpoint and relays commands to agents over SSH.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ops_core::config::{self, GatewayConfig};
use ops_gateway::gateway;
use ops_gateway::upstream::{ConfiguredCredentials, SshDialer};
use ops_gateway::GatewayState;

#[derive(Parser)]
#[command(name = "ops-gateway")]
#[command(about = "ServerOps gateway: streams agent output to WebSocket clients")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "OPS_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory of static files (overrides config)
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let default_path = config::default_gateway_config_path();
    let mut config: GatewayConfig = config::load_or_default(args.config.as_deref(), &default_path)
        .context("Failed to load gateway configuration")?;

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(dir) = args.static_dir {
        config.static_dir = Some(dir);
    }

    if args.write_config {
        let path = args.config.unwrap_or(default_path);
        config::save_config(&path, &config)?;
        tracing::info!("Wrote configuration to {:?}", path);
        return Ok(());
    }

    tracing::info!("ServerOps gateway starting...");

    let credentials = Arc::new(ConfiguredCredentials::from_config(&config.upstream)?);
    let dialer = Arc::new(SshDialer::new(config.upstream.clone(), credentials));

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_address))?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let state = Arc::new(GatewayState::new(config, dialer, cancel));
    gateway::serve(listener, state).await?;

    tracing::info!("Gateway shutdown complete");
    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => tracing::info!("Received SIGTERM, initiating shutdown..."),
    }

    cancel.cancel();
}
