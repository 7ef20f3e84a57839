//! One WebSocket client
//!
//! Frames are read strictly in order. Each text frame is a command
//! envelope that (re)starts the configured command on the client's
//! agent; output lines flow back through a separate writer task.

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use ops_core::config::SessionErrorPolicy;
use ops_core::traits::Dialer;
use ops_core::PtyRequest;
use ops_protocol::CommandEnvelope;

use crate::outbound::{self, OutboundQueue, OutboundSink};
use crate::state::GatewayState;
use crate::upstream::UpstreamManager;

/// Why a client connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    /// Client sent a close frame
    ClientClosed,
    /// Stream ended without a close frame
    Dropped,
    /// Gateway is shutting down
    Shutdown,
    /// Reading a frame failed
    ReadError,
    /// Envelope was not valid JSON or lacked a target
    Malformed,
    /// Dialing the agent failed or its connection was lost
    TransportFailed,
    /// Command failed to start under the fatal policy
    SessionFailed,
}

impl Termination {
    fn close_code(self) -> u16 {
        match self {
            Termination::ClientClosed | Termination::Dropped | Termination::Shutdown => {
                close_code::NORMAL
            }
            _ => close_code::ERROR,
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Termination::ClientClosed | Termination::Dropped => "",
            Termination::Shutdown => "gateway shutting down",
            Termination::ReadError => "read error",
            Termination::Malformed => "malformed command envelope",
            Termination::TransportFailed => "agent unreachable",
            Termination::SessionFailed => "command failed",
        }
    }
}

/// State of one client connection
pub struct ClientConnection<D: Dialer> {
    id: u64,
    peer: SocketAddr,
    command: String,
    pty: Option<PtyRequest>,
    session_errors: SessionErrorPolicy,
    outbound_buffer: usize,
    manager: UpstreamManager<D>,
    cancel: CancellationToken,
}

impl<D: Dialer> ClientConnection<D> {
    /// Prepare a connection; nothing is dialed until the first envelope
    pub fn new(id: u64, peer: SocketAddr, state: &GatewayState<D>) -> Self {
        let config = &state.config;
        Self {
            id,
            peer,
            command: config.command.clone(),
            pty: config.upstream.pty.request(),
            session_errors: config.session_errors,
            outbound_buffer: config.outbound_buffer,
            manager: UpstreamManager::new(state.dialer.clone(), config.target_policy),
            cancel: state.cancel.child_token(),
        }
    }

    /// Serve the client until it leaves, errs or the gateway shuts down
    pub async fn run(mut self, socket: WebSocket) {
        tracing::info!("Client {} connected from {}", self.id, self.peer);

        let (ws_tx, mut ws_rx) = socket.split();
        let (sink, queue) = outbound::channel(self.outbound_buffer);
        let writer_stop = CancellationToken::new();
        let writer = tokio::spawn(write_frames(self.id, ws_tx, queue, writer_stop.clone()));

        let termination = self.read_frames(&mut ws_rx, &sink).await;

        // Writer first, so nothing follows the close frame
        writer_stop.cancel();
        self.manager.shutdown().await;
        drop(sink);

        match writer.await {
            Ok(mut ws_tx) => {
                if termination != Termination::ClientClosed {
                    let frame = CloseFrame {
                        code: termination.close_code(),
                        reason: Cow::Borrowed(termination.reason()),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                }
                let _ = ws_tx.close().await;
            }
            Err(e) => tracing::error!("Client {}: writer task failed: {}", self.id, e),
        }

        tracing::info!("Client {} disconnected ({:?})", self.id, termination);
    }

    async fn read_frames(
        &mut self,
        ws_rx: &mut SplitStream<WebSocket>,
        sink: &OutboundSink,
    ) -> Termination {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Termination::Shutdown,
                frame = ws_rx.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(termination) = self.handle_envelope(&text, sink).await {
                        return termination;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::debug!("Client {}: ignoring {} byte binary frame", self.id, data.len());
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!("Client {} sent close: {:?}", self.id, frame);
                    return Termination::ClientClosed;
                }
                Some(Err(e)) => {
                    tracing::warn!("Client {}: read failed: {}", self.id, e);
                    return Termination::ReadError;
                }
                None => return Termination::Dropped,
            }
        }
    }

    async fn handle_envelope(&mut self, text: &str, sink: &OutboundSink) -> Result<(), Termination> {
        let envelope = CommandEnvelope::parse(text).map_err(|e| {
            tracing::warn!("Client {}: {}", self.id, e);
            Termination::Malformed
        })?;
        tracing::debug!("Client {}: {:?}", self.id, envelope);

        let target = if self.manager.has_transport() {
            envelope.target.trim()
        } else {
            envelope.require_target().map_err(|e| {
                tracing::warn!("Client {}: {}", self.id, e);
                Termination::Malformed
            })?
        };

        // Dial and exec may each take up to the connect timeout
        let ensured = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Termination::Shutdown),
            result = self.manager.ensure_transport(target) => result,
        };
        if let Err(e) = ensured {
            tracing::error!("Client {}: {}", self.id, e);
            return Err(Termination::TransportFailed);
        }

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Termination::Shutdown),
            result = self.manager.open_session(&self.command, self.pty.as_ref(), sink) => result,
        };

        match opened {
            Ok(id) => {
                tracing::debug!("Client {}: streaming {}", self.id, id);
                Ok(())
            }
            Err(e) if self.manager.transport_lost() => {
                tracing::error!("Client {}: {}; connection to agent lost", self.id, e);
                Err(Termination::TransportFailed)
            }
            Err(e) => match self.session_errors {
                SessionErrorPolicy::Recoverable => {
                    tracing::warn!("Client {}: {}; waiting for the next command", self.id, e);
                    Ok(())
                }
                SessionErrorPolicy::Fatal => {
                    tracing::error!("Client {}: {}", self.id, e);
                    Err(Termination::SessionFailed)
                }
            },
        }
    }
}

/// Send queued lines as text frames until stopped; hands the sink back
/// so the caller can send the close frame
async fn write_frames(
    id: u64,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut queue: OutboundQueue,
    stop: CancellationToken,
) -> SplitSink<WebSocket, Message> {
    loop {
        let line = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            line = queue.recv() => line,
        };

        let Some(line) = line else { break };
        if let Err(e) = ws_tx.send(Message::Text(line)).await {
            tracing::warn!("Client {}: write failed: {}", id, e);
            break;
        }
    }

    ws_tx
}
