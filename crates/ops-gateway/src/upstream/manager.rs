//! Upstream connection manager
//!
//! Owns at most one transport and at most one session per client
//! connection. Opening a new session first kills the previous one.

use std::sync::Arc;

use ops_core::config::TargetPolicy;
use ops_core::error::{SessionError, TransportError};
use ops_core::traits::{Dialer, Transport};
use ops_core::{PtyRequest, SessionState, SessionStatus};
use ops_protocol::SessionId;

use crate::outbound::OutboundSink;
use crate::upstream::session::ActiveSession;

/// Transport side of the manager
pub enum UpstreamState<T> {
    /// Nothing dialed yet (or closed)
    NoTransport,
    /// Connected to an agent
    TransportOpen { transport: T },
}

/// Session side of the manager
pub enum SessionSlot {
    /// No session started since the last teardown
    Idle,
    /// A started session; its own status may already be terminal
    Running(ActiveSession),
}

/// Per-client upstream state machine
pub struct UpstreamManager<D: Dialer> {
    dialer: Arc<D>,
    policy: TargetPolicy,
    state: UpstreamState<D::Transport>,
    slot: SessionSlot,
}

impl<D: Dialer> UpstreamManager<D> {
    /// Create a manager with no transport
    pub fn new(dialer: Arc<D>, policy: TargetPolicy) -> Self {
        Self {
            dialer,
            policy,
            state: UpstreamState::NoTransport,
            slot: SessionSlot::Idle,
        }
    }

    /// Whether a transport is open
    pub fn has_transport(&self) -> bool {
        matches!(self.state, UpstreamState::TransportOpen { .. })
    }

    /// Target of the open transport
    pub fn target(&self) -> Option<&str> {
        match &self.state {
            UpstreamState::TransportOpen { transport } => Some(transport.target()),
            UpstreamState::NoTransport => None,
        }
    }

    /// Whether the open transport has gone away underneath us
    pub fn transport_lost(&self) -> bool {
        match &self.state {
            UpstreamState::TransportOpen { transport } => transport.is_closed(),
            UpstreamState::NoTransport => false,
        }
    }

    /// Status of the current session
    pub fn session_status(&self) -> Option<SessionStatus> {
        match &self.slot {
            SessionSlot::Running(session) => Some(session.status()),
            SessionSlot::Idle => None,
        }
    }

    /// Make sure a transport to `requested` is open
    ///
    /// An empty `requested` keeps whatever is open. A different target
    /// is ignored under [`TargetPolicy::Pin`] and replaces the transport
    /// under [`TargetPolicy::Reconnect`]. A transport that was lost is
    /// torn down and reported, never silently redialed.
    pub async fn ensure_transport(&mut self, requested: &str) -> Result<(), TransportError> {
        if self.transport_lost() {
            return Err(self.drop_lost_transport().await);
        }

        if let Some(current) = self.target() {
            if requested.is_empty() || requested == current {
                return Ok(());
            }

            match self.policy {
                TargetPolicy::Pin => {
                    tracing::warn!(
                        "Ignoring target {}: connection is pinned to {}",
                        requested,
                        current
                    );
                    return Ok(());
                }
                TargetPolicy::Reconnect => {
                    tracing::info!("Target changed from {} to {}, reconnecting", current, requested);
                    self.stop_session().await;
                    self.close_transport().await;
                }
            }
        }

        let transport = self.dialer.dial(requested).await?;
        self.state = UpstreamState::TransportOpen { transport };
        Ok(())
    }

    /// Start `command`, superseding any previous session
    pub async fn open_session(
        &mut self,
        command: &str,
        pty: Option<&PtyRequest>,
        sink: &OutboundSink,
    ) -> Result<SessionId, SessionError> {
        if let Some(previous) = self.stop_session().await {
            tracing::debug!("Previous session ended as {}", previous);
        }

        let UpstreamState::TransportOpen { transport } = &mut self.state else {
            return Err(SessionError::NoTransport);
        };

        let id = SessionId::next();
        let remote = transport.open_session(id, command, pty).await?;
        tracing::info!("{}: '{}' running on {}", id, command, transport.target());

        self.slot = SessionSlot::Running(ActiveSession::start(remote, command, sink.clone()));
        Ok(id)
    }

    /// Kill and reap the current session, if any
    pub async fn stop_session(&mut self) -> Option<SessionState> {
        match std::mem::replace(&mut self.slot, SessionSlot::Idle) {
            SessionSlot::Idle => None,
            SessionSlot::Running(mut session) => Some(session.kill().await),
        }
    }

    /// Tear everything down. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.stop_session().await;
        self.close_transport().await;
    }

    async fn drop_lost_transport(&mut self) -> TransportError {
        let address = self.target().unwrap_or_default().to_string();
        tracing::warn!("Connection to {} was lost", address);
        self.shutdown().await;
        TransportError::Lost { address }
    }

    async fn close_transport(&mut self) {
        if let UpstreamState::TransportOpen { mut transport } =
            std::mem::replace(&mut self.state, UpstreamState::NoTransport)
        {
            if let Err(e) = transport.close().await {
                tracing::warn!("Closing transport to {}: {}", transport.target(), e);
            }
        }
    }
}
