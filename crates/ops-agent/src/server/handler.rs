//! Per-connection SSH handler
//!
//! Every session channel carries exactly one command. `exec` starts it,
//! `pty-req` only contributes `TERM`, and closing the channel (or the
//! whole connection) kills whatever is still running.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use russh_keys::key::PublicKey;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ops_core::PtyRequest;
use ops_protocol::{CommandToken, SessionId};

use crate::session::{self, ChannelReply};
use crate::state::AgentState;

/// Per-channel bookkeeping
struct ChannelContext {
    cancel: CancellationToken,
    pty: Option<PtyRequest>,
    started: bool,
}

/// Handler for one SSH connection
pub struct SessionHandler {
    state: Arc<AgentState>,
    peer_addr: SocketAddr,
    user: Option<String>,
    channels: HashMap<ChannelId, ChannelContext>,
    tracker: TaskTracker,
    /// Parent of every channel token on this connection
    cancel: CancellationToken,
}

impl SessionHandler {
    /// Create a handler for a freshly accepted connection
    pub fn new(
        state: Arc<AgentState>,
        peer_addr: SocketAddr,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            peer_addr,
            user: None,
            channels: HashMap::new(),
            tracker,
            cancel,
        }
    }

    /// Start the command for `channel`
    fn start(&mut self, channel: ChannelId, request: Option<CommandToken>, session: &mut Session) {
        let Some(context) = self.channels.get_mut(&channel) else {
            tracing::warn!("Command on unknown channel {:?} from {}", channel, self.peer_addr);
            let _ = session.channel_failure(channel);
            return;
        };

        if context.started {
            tracing::warn!("Channel {:?} from {} already runs a command", channel, self.peer_addr);
            let _ = session.channel_failure(channel);
            return;
        }
        context.started = true;

        let env = context
            .pty
            .as_ref()
            .map(|pty| vec![("TERM".to_string(), pty.term.clone())])
            .unwrap_or_default();
        let cancel = context.cancel.clone();
        let reply = Arc::new(ChannelReply::new(session.handle(), channel));
        let commands = Arc::clone(&self.state.commands);
        let id = SessionId::next();

        tracing::info!(
            "{} on {:?} for {}@{}: {:?}",
            id,
            channel,
            self.user.as_deref().unwrap_or("?"),
            self.peer_addr,
            request.as_ref().map(|token| token.name())
        );

        self.tracker.spawn(async move {
            if let Some(state) = session::serve(id, request, &commands, reply, env, cancel).await {
                tracing::debug!("{} finished as {}", id, state);
            }
        });

        let _ = session.channel_success(channel);
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        // Connection gone: every process it started goes too
        self.cancel.cancel();
    }
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.state.auth.check_password(password) {
            tracing::info!("Password auth accepted for {}@{}", user, self.peer_addr);
            self.user = Some(user.to_string());
            return Ok(Auth::Accept);
        }

        tracing::warn!("Password auth rejected for {}@{}", user, self.peer_addr);
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint();

        if self.state.auth.check_key(public_key) {
            tracing::info!("Key {} accepted for {}@{}", fingerprint, user, self.peer_addr);
            self.user = Some(user.to_string());
            return Ok(Auth::Accept);
        }

        tracing::warn!("Key {} rejected for {}@{}", fingerprint, user, self.peer_addr);
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        tracing::debug!("Channel {:?} opened by {}", channel_id, self.peer_addr);

        self.channels.insert(
            channel_id,
            ChannelContext {
                cancel: self.cancel.child_token(),
                pty: None,
                started: false,
            },
        );
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get_mut(&channel) {
            Some(context) => {
                tracing::debug!("PTY on {:?}: {} {}x{}", channel, term, col_width, row_height);
                context.pty = Some(PtyRequest {
                    term: term.to_string(),
                    cols: col_width,
                    rows: row_height,
                });
                let _ = session.channel_success(channel);
            }
            None => {
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start(channel, CommandToken::parse(data), session);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // No interactive shell: behaves like an empty command
        self.start(channel, None, session);
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!("Channel EOF: {:?}", channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(context) = self.channels.remove(&channel) {
            tracing::debug!("Channel {:?} closed by {}", channel, self.peer_addr);
            context.cancel.cancel();
        }
        Ok(())
    }
}

/// SSH server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// russh server configuration
    pub ssh_config: Arc<russh::server::Config>,
}

impl ServerConfig {
    /// Server configuration presenting `host_key`
    pub fn new(host_key: russh_keys::key::KeyPair) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.auth_rejection_time = std::time::Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(std::time::Duration::from_secs(0));

        Self {
            ssh_config: Arc::new(config),
        }
    }
}
