//! ops-core: Core abstractions and configuration for the ServerOps bridge
//!
//! This crate provides the configuration structures, error taxonomy,
//! shared session state machine, and the seam traits (`Dialer`,
//! `Transport`, `CredentialProvider`) used by the gateway and the agent.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{ConfigError, SessionError, StreamError, TransportError};
pub use types::{PtyRequest, SessionState, SessionStatus, StreamKind};
