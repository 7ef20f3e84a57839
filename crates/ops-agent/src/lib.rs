//! ops-agent: SSH side of the ServerOps bridge
//!
//! Accepts SSH connections, maps each requested command token to a
//! fixed local process and streams its output back over the channel.
//! Closing the channel kills the process.

pub mod auth;
pub mod command;
pub mod runner;
pub mod server;
pub mod session;
pub mod state;

pub use command::{CommandSpec, CommandTable};
pub use server::AgentServer;
pub use state::AgentState;
