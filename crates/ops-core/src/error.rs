//! Core error types for the ServerOps bridge
//!
//! Errors are grouped by the boundary that owns them: transport errors end
//! a client connection, session errors end one command, stream errors end
//! one forwarding task.

use ops_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::StreamKind;

/// Failures establishing the upstream SSH connection. Fatal to the client
/// connection that triggered them; never retried.
#[derive(Error, Debug)]
pub enum TransportError {
    /// TCP connect or SSH handshake failed
    #[error("Failed to connect to {address}: {message}")]
    Dial { address: String, message: String },

    /// Connect did not finish in time
    #[error("Connection to {address} timed out")]
    Timeout { address: String },

    /// Server rejected our credentials
    #[error("Authentication rejected by {address}")]
    Auth { address: String },

    /// Server presented an unexpected host key
    #[error("Host key verification failed for {address}")]
    HostKey { address: String },

    /// No credential could be produced for the target
    #[error("No usable credential: {0}")]
    Credential(String),

    /// An open connection went away underneath us
    #[error("Connection to {address} was lost")]
    Lost { address: String },

    /// Error while tearing the connection down
    #[error("Failed to close connection: {0}")]
    Close(String),
}

/// Failures opening or starting a remote command
#[derive(Error, Debug)]
pub enum SessionError {
    /// No transport has been established yet
    #[error("No upstream transport is open")]
    NoTransport,

    /// Channel could not be opened
    #[error("Failed to open session channel: {0}")]
    ChannelOpen(String),

    /// PTY allocation was refused or failed
    #[error("PTY request failed: {0}")]
    Pty(String),

    /// The remote side refused to run the command
    #[error("Remote refused command '{0}'")]
    Refused(String),

    /// The channel closed before the command was acknowledged
    #[error("Session closed before command '{0}' started")]
    UnexpectedClose(String),
}

/// Failures reading one output stream
#[derive(Error, Debug)]
pub enum StreamError {
    /// Decoding the stream failed
    #[error("Failed to read {stream}: {source}")]
    Read {
        stream: StreamKind,
        #[source]
        source: ProtocolError,
    },

    /// The outbound side went away
    #[error("Outbound channel closed while forwarding {0}")]
    SinkClosed(StreamKind),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
