//! SSH implementation of the upstream transport
//!
//! One SSH connection per client. Every command runs in its own session
//! channel; a pump task demultiplexes the channel into stdout/stderr
//! chunks and the exit status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use ops_core::config::UpstreamConfig;
use ops_core::error::{SessionError, TransportError};
use ops_core::traits::{Credential, CredentialProvider, Dialer, RemoteSession, Transport};
use ops_core::PtyRequest;
use ops_protocol::SessionId;

/// Chunks buffered per stream between the pump and the line forwarder
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// SSH extended data type for stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Dials agents over SSH
pub struct SshDialer {
    config: UpstreamConfig,
    credentials: Arc<dyn CredentialProvider>,
}

impl SshDialer {
    /// Create a dialer
    pub fn new(config: UpstreamConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            config,
            credentials,
        }
    }
}

#[async_trait]
impl Dialer for SshDialer {
    type Transport = SshTransport;

    async fn dial(&self, target: &str) -> Result<SshTransport, TransportError> {
        let address = format!("{}:{}", target, self.config.port);
        let credential = self.credentials.credential_for(target).await?;

        let host_key_rejected = Arc::new(AtomicBool::new(false));
        let handler = UpstreamHandler {
            address: address.clone(),
            expected_host_key: self.config.expected_host_key.clone(),
            host_key_rejected: Arc::clone(&host_key_rejected),
        };

        tracing::debug!("Connecting to {}", address);
        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(Arc::new(Config::default()), (target, self.config.port), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            address: address.clone(),
        })?
        .map_err(|e| {
            if host_key_rejected.load(Ordering::SeqCst) {
                TransportError::HostKey {
                    address: address.clone(),
                }
            } else {
                TransportError::Dial {
                    address: address.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        tracing::debug!(
            "Authenticating to {} as '{}' ({})",
            address,
            credential.username(),
            credential.method()
        );
        let authenticated = match &credential {
            Credential::Password { username, password } => {
                handle
                    .authenticate_password(username.as_str(), password.as_str())
                    .await
            }
            Credential::PrivateKey { username, key } => {
                handle
                    .authenticate_publickey(username.as_str(), Arc::clone(key))
                    .await
            }
        }
        .map_err(|e| TransportError::Dial {
            address: address.clone(),
            message: format!("Authentication error: {}", e),
        })?;

        if !authenticated {
            return Err(TransportError::Auth { address });
        }

        tracing::info!("Connected to agent at {}", address);
        Ok(SshTransport {
            target: target.to_string(),
            address,
            handle,
        })
    }
}

/// An authenticated SSH connection to one agent
pub struct SshTransport {
    target: String,
    address: String,
    handle: Handle<UpstreamHandler>,
}

#[async_trait]
impl Transport for SshTransport {
    fn target(&self) -> &str {
        &self.target
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn open_session(
        &mut self,
        id: SessionId,
        command: &str,
        pty: Option<&PtyRequest>,
    ) -> Result<RemoteSession, SessionError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::ChannelOpen(e.to_string()))?;

        let (stdout_tx, stdout_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let early = EarlyOutput {
            stdout: &stdout_tx,
            stderr: &stderr_tx,
        };

        if let Some(pty) = pty {
            channel
                .request_pty(true, &pty.term, pty.cols, pty.rows, 0, 0, &[])
                .await
                .map_err(|e| SessionError::Pty(e.to_string()))?;
            match early.await_reply(&mut channel).await {
                Some(true) => {}
                Some(false) => return Err(SessionError::Pty(format!("refused by {}", self.address))),
                None => return Err(SessionError::UnexpectedClose(command.to_string())),
            }
        }

        channel
            .exec(true, command)
            .await
            .map_err(|e| SessionError::ChannelOpen(e.to_string()))?;
        match early.await_reply(&mut channel).await {
            Some(true) => {}
            Some(false) => return Err(SessionError::Refused(command.to_string())),
            None => return Err(SessionError::UnexpectedClose(command.to_string())),
        }

        tracing::debug!("{}: '{}' started on {}", id, command, self.address);

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let pump = tokio::spawn(pump_channel(
            id,
            channel,
            stdout_tx,
            stderr_tx,
            exit_tx,
            cancel.clone(),
        ));

        Ok(RemoteSession {
            id,
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: exit_rx,
            cancel,
            pump: Some(pump),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        tracing::debug!("Disconnecting from {}", self.address);
        self.handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }
}

/// Output that arrives while a request is still awaiting its reply
struct EarlyOutput<'a> {
    stdout: &'a mpsc::Sender<Bytes>,
    stderr: &'a mpsc::Sender<Bytes>,
}

impl EarlyOutput<'_> {
    /// Wait for Success/Failure, keeping any output that races ahead.
    /// `None` means the channel closed first.
    async fn await_reply(&self, channel: &mut Channel<Msg>) -> Option<bool> {
        loop {
            match channel.wait().await? {
                ChannelMsg::Success => return Some(true),
                ChannelMsg::Failure => return Some(false),
                ChannelMsg::Data { data } => {
                    let _ = self.stdout.try_send(Bytes::copy_from_slice(&data));
                }
                ChannelMsg::ExtendedData { data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                    let _ = self.stderr.try_send(Bytes::copy_from_slice(&data));
                }
                ChannelMsg::Close => return None,
                other => tracing::trace!("Ignoring {:?} before reply", other),
            }
        }
    }
}

/// Move channel traffic into the session's streams until the channel
/// closes or the session is cancelled
async fn pump_channel(
    id: SessionId,
    mut channel: Channel<Msg>,
    stdout: mpsc::Sender<Bytes>,
    stderr: mpsc::Sender<Bytes>,
    exit: oneshot::Sender<Option<u32>>,
    cancel: CancellationToken,
) {
    let mut exit_status = None;

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("{}: closing channel", id);
                if let Err(e) = channel.close().await {
                    tracing::debug!("{}: close failed: {}", id, e);
                }
                break;
            }
            msg = channel.wait() => msg,
        };

        match msg {
            Some(ChannelMsg::Data { data }) => {
                let _ = stdout.send(Bytes::copy_from_slice(&data)).await;
            }
            Some(ChannelMsg::ExtendedData { data, ext }) if ext == SSH_EXTENDED_DATA_STDERR => {
                let _ = stderr.send(Bytes::copy_from_slice(&data)).await;
            }
            Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                exit_status = Some(status);
            }
            Some(ChannelMsg::Eof) => tracing::trace!("{}: EOF", id),
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }

    let _ = exit.send(exit_status);
}

/// russh client handler: host key verification only
pub struct UpstreamHandler {
    address: String,
    expected_host_key: Option<String>,
    host_key_rejected: Arc<AtomicBool>,
}

#[async_trait]
impl client::Handler for UpstreamHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();

        match &self.expected_host_key {
            None => {
                tracing::debug!("Host key of {}: {} (not pinned)", self.address, fingerprint);
                Ok(true)
            }
            Some(expected) if fingerprint_matches(expected, &fingerprint) => {
                tracing::debug!("Host key of {} verified", self.address);
                Ok(true)
            }
            Some(expected) => {
                tracing::warn!(
                    "Host key of {} differs from configured: expected {}, got {}",
                    self.address,
                    expected,
                    fingerprint
                );
                self.host_key_rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }
}

/// Compare fingerprints, tolerating an `SHA256:` prefix on either side
fn fingerprint_matches(expected: &str, actual: &str) -> bool {
    let strip = |fp: &str| fp.trim().trim_start_matches("SHA256:").to_string();
    strip(expected) == strip(actual)
}
