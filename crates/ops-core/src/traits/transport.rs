//! Upstream transport traits
//!
//! The gateway talks to agents through these traits so the connection
//! manager does not depend on SSH directly. The production implementation
//! lives in `ops-gateway::upstream::ssh`.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ops_protocol::SessionId;

use crate::error::{SessionError, TransportError};
use crate::types::PtyRequest;

/// The raw streams of one remote command
///
/// Output arrives as byte chunks with no line alignment. `exit` resolves
/// with the remote exit status (if one was reported) once the remote side
/// finished, or is dropped if the session ended without one. Cancelling
/// `cancel` closes the remote channel, which makes the agent kill the
/// process.
#[derive(Debug)]
pub struct RemoteSession {
    /// Identifier used in logs
    pub id: SessionId,
    /// Standard output chunks
    pub stdout: mpsc::Receiver<Bytes>,
    /// Standard error chunks
    pub stderr: mpsc::Receiver<Bytes>,
    /// Exit status of the remote command
    pub exit: oneshot::Receiver<Option<u32>>,
    /// Closes the remote side when cancelled
    pub cancel: CancellationToken,
    /// Task pumping the underlying channel, joined on teardown
    pub pump: Option<JoinHandle<()>>,
}

/// An established connection to an agent
#[async_trait]
pub trait Transport: Send + 'static {
    /// The target this transport was dialed for
    fn target(&self) -> &str;

    /// Whether the underlying connection has gone away
    fn is_closed(&self) -> bool;

    /// Start `command` in a new remote session
    async fn open_session(
        &mut self,
        id: SessionId,
        command: &str,
        pty: Option<&PtyRequest>,
    ) -> Result<RemoteSession, SessionError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Establishes transports to agents
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// The transport type produced by this dialer
    type Transport: Transport;

    /// Connect and authenticate to `target`
    async fn dial(&self, target: &str) -> Result<Self::Transport, TransportError>;
}
