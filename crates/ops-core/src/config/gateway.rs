//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use ops_protocol::COMMAND_LOGS;

use super::serde_utils::duration_secs;
use crate::types::PtyRequest;

/// Configuration for the WebSocket gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind the HTTP server to
    pub bind_address: String,

    /// Route serving the WebSocket endpoint
    pub ws_path: String,

    /// Directory of static files served for every other path
    pub static_dir: Option<PathBuf>,

    /// Command sent to the agent for every envelope
    pub command: String,

    /// What to do when a later envelope names a different target
    pub target_policy: TargetPolicy,

    /// Whether a failed command ends the client connection
    pub session_errors: SessionErrorPolicy,

    /// Outbound frames buffered per client before forwarders wait
    pub outbound_buffer: usize,

    /// Upstream SSH settings
    pub upstream: UpstreamConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            ws_path: "/logs".to_string(),
            static_dir: Some(PathBuf::from("./public")),
            command: COMMAND_LOGS.to_string(),
            target_policy: TargetPolicy::default(),
            session_errors: SessionErrorPolicy::default(),
            outbound_buffer: 256,
            upstream: UpstreamConfig::default(),
        }
    }
}

/// Handling of `target` on envelopes after the first one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetPolicy {
    /// The first target pins the connection; later targets are ignored
    #[default]
    Pin,
    /// A different target tears down the transport and dials the new one
    Reconnect,
}

/// Handling of a command that fails to start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionErrorPolicy {
    /// Log it and keep the connection for the next command
    #[default]
    Recoverable,
    /// Close the client connection
    Fatal,
}

/// Upstream SSH connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Agent port appended to every target
    pub port: u16,

    /// User name to authenticate as
    pub username: String,

    /// Password, used when no private key is available
    pub password: Option<String>,

    /// Private key used for public key authentication
    pub private_key_path: Option<PathBuf>,

    /// Expected agent host key fingerprint. Any key is accepted when unset.
    pub expected_host_key: Option<String>,

    /// TCP connect and handshake timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Pseudo-terminal requested for every session
    pub pty: PtyConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            port: 2222,
            username: "root".to_string(),
            password: None,
            private_key_path: dirs::home_dir().map(|home| home.join(".ssh").join("id_ed25519")),
            expected_host_key: None,
            connect_timeout: Duration::from_secs(10),
            pty: PtyConfig::default(),
        }
    }
}

/// PTY request settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    /// Whether to request a PTY at all
    pub enabled: bool,
    /// Terminal type
    pub term: String,
    /// Width in columns
    pub cols: u32,
    /// Height in rows
    pub rows: u32,
}

impl Default for PtyConfig {
    fn default() -> Self {
        let request = PtyRequest::default();
        Self {
            enabled: true,
            term: request.term,
            cols: request.cols,
            rows: request.rows,
        }
    }
}

impl PtyConfig {
    /// The request to send, if enabled
    pub fn request(&self) -> Option<PtyRequest> {
        self.enabled.then(|| PtyRequest {
            term: self.term.clone(),
            cols: self.cols,
            rows: self.rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.command, "logs");
        assert_eq!(config.upstream.port, 2222);
        assert_eq!(config.target_policy, TargetPolicy::Pin);
        assert_eq!(config.session_errors, SessionErrorPolicy::Recoverable);
        assert!(config.upstream.pty.request().is_some());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: GatewayConfig = toml::from_str(
            r#"
bind_address = "127.0.0.1:9000"
target_policy = "reconnect"
session_errors = "fatal"

[upstream]
username = "ops"
password = "pw"
connect_timeout = 3

[upstream.pty]
enabled = false
"#,
        )
        .unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.ws_path, "/logs");
        assert_eq!(config.target_policy, TargetPolicy::Reconnect);
        assert_eq!(config.session_errors, SessionErrorPolicy::Fatal);
        assert_eq!(config.upstream.username, "ops");
        assert_eq!(config.upstream.port, 2222);
        assert_eq!(config.upstream.connect_timeout, Duration::from_secs(3));
        assert!(config.upstream.pty.request().is_none());
    }
}
