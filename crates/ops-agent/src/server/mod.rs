//! SSH server implementation

mod handler;
mod listener;

pub use handler::{ServerConfig, SessionHandler};
pub use listener::{ephemeral_host_key, load_or_generate_host_key, AgentServer};
