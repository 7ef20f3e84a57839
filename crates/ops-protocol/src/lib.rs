//! ops-protocol: Wire types for the ServerOps bridge
//!
//! This crate defines what travels over the two hops of the bridge:
//! the JSON command envelopes browsers send to the gateway, the command
//! vocabulary the agent understands, and the line framing used to turn
//! process output into one text frame per line.

pub mod codec;
pub mod command;
pub mod envelope;
pub mod error;
pub mod session;

pub use codec::{LineCodec, MAX_LINE_LENGTH};
pub use command::{unknown_command_reply, CommandToken, COMMAND_LOGS, COMMAND_PROCESS};
pub use envelope::CommandEnvelope;
pub use error::ProtocolError;
pub use session::SessionId;
