//! Upstream side of the gateway: SSH transport, sessions and the
//! per-client manager tying them together

mod credentials;
mod manager;
mod session;
mod ssh;

pub use credentials::ConfiguredCredentials;
pub use manager::{SessionSlot, UpstreamManager, UpstreamState};
pub use session::ActiveSession;
pub use ssh::{SshDialer, SshTransport, UpstreamHandler};
