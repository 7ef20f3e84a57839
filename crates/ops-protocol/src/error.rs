//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding client or process data
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Envelope payload was not valid JSON or did not match the schema
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    /// Envelope carried an empty target where one is required
    #[error("Envelope target is empty")]
    EmptyTarget,

    /// I/O error while reading a line stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
