//! ops-gateway: WebSocket side of the ServerOps bridge
//!
//! Browsers send a JSON command envelope naming a target host; the
//! gateway dials that host's agent over SSH, starts the configured
//! command and relays its output back one text frame per line.

pub mod gateway;
pub mod outbound;
pub mod state;
pub mod upstream;

pub use state::GatewayState;
