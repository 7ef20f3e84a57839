//! ServerOps agent daemon
//!
//! Accepts SSH connections and runs allow-listed commands for them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ops_agent::auth::Authenticator;
use ops_agent::server::{load_or_generate_host_key, AgentServer};
use ops_agent::AgentState;
use ops_core::config::{self, AgentConfig};

#[derive(Parser)]
#[command(name = "ops-agent")]
#[command(about = "ServerOps agent: runs allow-listed commands over SSH")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "OPS_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

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

    let default_path = config::default_agent_config_path();
    let mut config: AgentConfig = config::load_or_default(args.config.as_deref(), &default_path)
        .context("Failed to load agent configuration")?;

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }

    if args.write_config {
        let path = args.config.unwrap_or(default_path);
        config::save_config(&path, &config)?;
        tracing::info!("Wrote configuration to {:?}", path);
        return Ok(());
    }

    tracing::info!("ServerOps agent starting...");

    let host_key = load_or_generate_host_key(&config.host_key_path).await?;
    tracing::info!(
        "Host key fingerprint: {}",
        host_key.clone_public_key()?.fingerprint()
    );

    let auth = Authenticator::from_config(&config)?;
    let bind_addr = config.bind_address.clone();
    let grace = config.shutdown_grace;
    let state = Arc::new(AgentState::new(config, auth));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let server = AgentServer::new(host_key, state, cancel);
    let result = server.run(&bind_addr).await;

    server.shutdown(grace).await;
    tracing::info!("Agent shutdown complete");
    result
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
