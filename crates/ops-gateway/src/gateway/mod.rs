//! WebSocket side of the gateway

mod connection;
mod server;

pub use connection::ClientConnection;
pub use server::{router, serve};
