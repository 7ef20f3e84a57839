//! SSH server listener

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::Disconnect;
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::server::handler::{ServerConfig, SessionHandler};
use crate::state::AgentState;

/// Accepts SSH connections and runs a [`SessionHandler`] for each
pub struct AgentServer {
    config: ServerConfig,
    state: Arc<AgentState>,
    cancel: CancellationToken,
    /// Connection and session tasks
    tracker: TaskTracker,
}

impl AgentServer {
    /// Create a server
    pub fn new(host_key: KeyPair, state: Arc<AgentState>, cancel: CancellationToken) -> Self {
        Self {
            config: ServerConfig::new(host_key),
            state,
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    /// Bind `bind_addr` and serve until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("SSH server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    /// Wait up to `grace` for connections and sessions to wind down
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                "{} tasks still running after {:?}, exiting anyway",
                self.tracker.len(),
                grace
            );
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::info!("New connection from {}", peer_addr);

        let config = Arc::clone(&self.config.ssh_config);
        let cancel = self.cancel.child_token();
        let handler = SessionHandler::new(
            Arc::clone(&self.state),
            peer_addr,
            self.tracker.clone(),
            cancel.clone(),
        );

        self.tracker.spawn(async move {
            let running = match russh::server::run_stream(config, socket, handler).await {
                Ok(running) => running,
                Err(e) => {
                    tracing::warn!("Handshake with {} failed: {}", peer_addr, e);
                    return;
                }
            };
            let handle = running.handle();

            tokio::select! {
                result = running => match result {
                    Ok(()) => tracing::info!("Connection from {} closed", peer_addr),
                    Err(e) => tracing::warn!("Connection from {} closed with error: {}", peer_addr, e),
                },
                _ = cancel.cancelled() => {
                    tracing::debug!("Disconnecting {}", peer_addr);
                    let _ = handle
                        .disconnect(Disconnect::ByApplication, "agent shutting down".into(), "en".into())
                        .await;
                }
            }
        });
    }
}

/// Load the host key, generating and saving one on first start
pub async fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if !path.exists() {
        tracing::info!("Generating new host key at {:?}", path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let status = tokio::process::Command::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", "ops-agent host key", "-f"])
            .arg(path)
            .status()
            .await;

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                tracing::warn!("ssh-keygen exited with {}, using an ephemeral host key", status);
                return ephemeral_host_key();
            }
            Err(e) => {
                tracing::warn!("ssh-keygen unavailable ({}), using an ephemeral host key", e);
                return ephemeral_host_key();
            }
        }
    }

    tracing::info!("Loading host key from {:?}", path);
    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("Failed to load host key from {:?}", path))
}

/// In-memory Ed25519 key; changes on every restart
pub fn ephemeral_host_key() -> Result<KeyPair> {
    KeyPair::generate_ed25519().ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))
}
