//! Gateway-side execution sessions
//!
//! Turns the raw chunk streams of a [`RemoteSession`] into whole lines
//! on the client's outbound queue and tracks the session state.

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use ops_core::error::StreamError;
use ops_core::traits::RemoteSession;
use ops_core::{SessionState, SessionStatus, StreamKind};
use ops_protocol::{LineCodec, SessionId};

use crate::outbound::OutboundSink;

/// A started remote command and its forwarding tasks
pub struct ActiveSession {
    id: SessionId,
    command: String,
    status: SessionStatus,
    /// Closes the remote channel
    cancel: CancellationToken,
    /// Stops the local forwarding tasks
    stop: CancellationToken,
    sink: OutboundSink,
    tasks: JoinSet<()>,
    pump: Option<JoinHandle<()>>,
}

impl ActiveSession {
    /// Start forwarding `remote` into `sink`
    pub fn start(remote: RemoteSession, command: impl Into<String>, sink: OutboundSink) -> Self {
        let RemoteSession {
            id,
            stdout,
            stderr,
            exit,
            cancel,
            pump,
        } = remote;

        let status = SessionStatus::new();
        status.transition(SessionState::Running);
        sink.activate(id);

        let stop = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tasks.spawn(forward_lines(
            id,
            StreamKind::Stdout,
            stdout,
            sink.clone(),
            stop.clone(),
        ));
        tasks.spawn(forward_lines(
            id,
            StreamKind::Stderr,
            stderr,
            sink.clone(),
            stop.clone(),
        ));
        tasks.spawn(await_exit(id, exit, status.clone(), stop.clone()));

        Self {
            id,
            command: command.into(),
            status,
            cancel,
            stop,
            sink,
            tasks,
            pump,
        }
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Command this session runs
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Observable state
    pub fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    /// Kill the remote command and wait for every task
    ///
    /// Only a running session is killed; a session that already finished
    /// is just reaped. Either way no further output reaches the client.
    pub async fn kill(&mut self) -> SessionState {
        if self.status.transition(SessionState::Killed) {
            tracing::info!("{}: killing '{}'", self.id, self.command);
            self.cancel.cancel();
        }

        self.sink.deactivate(self.id);
        self.stop.cancel();
        self.join().await;
        self.status.get()
    }

    async fn join(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!("{}: forwarding task panicked: {}", self.id, e);
                }
            }
        }

        if let Some(pump) = self.pump.take() {
            if !self.cancel.is_cancelled() {
                // Finished remotely; the pump has nothing left to close
                pump.abort();
            }
            match pump.await {
                Err(e) if e.is_panic() => tracing::error!("{}: pump task panicked: {}", self.id, e),
                _ => {}
            }
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if !self.status.get().is_terminal() {
            self.cancel.cancel();
        }
        self.stop.cancel();
    }
}

/// Reassemble lines from raw chunks and queue them for the client
async fn forward_lines(
    id: SessionId,
    kind: StreamKind,
    mut chunks: mpsc::Receiver<Bytes>,
    sink: OutboundSink,
    stop: CancellationToken,
) {
    let mut codec = LineCodec::new();
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    loop {
        let chunk = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            chunk = chunks.recv() => chunk,
        };

        let Some(chunk) = chunk else { break };
        buffer.extend_from_slice(&chunk);

        loop {
            match codec.decode(&mut buffer) {
                Ok(Some(line)) => {
                    if !deliver(id, kind, &sink, line, &stop).await {
                        return;
                    }
                }
                Ok(None) => break,
                Err(source) => {
                    tracing::warn!("{}: {}", id, StreamError::Read { stream: kind, source });
                    return;
                }
            }
        }
    }

    // Stream ended: flush a trailing line without newline
    while let Ok(Some(line)) = codec.decode_eof(&mut buffer) {
        if !deliver(id, kind, &sink, line, &stop).await {
            return;
        }
    }
}

async fn deliver(
    id: SessionId,
    kind: StreamKind,
    sink: &OutboundSink,
    line: String,
    stop: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        result = sink.send(id, line) => match result {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("{}: {}", id, StreamError::SinkClosed(kind));
                false
            }
        },
    }
}

/// Record how the remote command ended
async fn await_exit(
    id: SessionId,
    exit: oneshot::Receiver<Option<u32>>,
    status: SessionStatus,
    stop: CancellationToken,
) {
    tokio::select! {
        _ = stop.cancelled() => {}
        result = exit => match result {
            Ok(Some(code)) => {
                if status.transition(SessionState::Completed) {
                    tracing::info!("{}: completed with exit status {}", id, code);
                }
            }
            Ok(None) | Err(_) => {
                if status.transition(SessionState::Failed) {
                    tracing::warn!("{}: channel closed without exit status", id);
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound;
    use std::time::Duration;
    use tokio::time::timeout;

    struct FakeRemote {
        stdout: mpsc::Sender<Bytes>,
        stderr: mpsc::Sender<Bytes>,
        exit: oneshot::Sender<Option<u32>>,
        cancel: CancellationToken,
    }

    fn remote() -> (RemoteSession, FakeRemote) {
        let (stdout_tx, stdout) = mpsc::channel(16);
        let (stderr_tx, stderr) = mpsc::channel(16);
        let (exit_tx, exit) = oneshot::channel();
        let cancel = CancellationToken::new();

        (
            RemoteSession {
                id: SessionId::next(),
                stdout,
                stderr,
                exit,
                cancel: cancel.clone(),
                pump: None,
            },
            FakeRemote {
                stdout: stdout_tx,
                stderr: stderr_tx,
                exit: exit_tx,
                cancel,
            },
        )
    }

    #[tokio::test]
    async fn test_chunks_become_lines() {
        let (sink, mut queue) = outbound::channel(16);
        let (remote, fake) = remote();
        let mut session = ActiveSession::start(remote, "logs", sink);

        fake.stdout.send(Bytes::from_static(b"L1\nL")).await.unwrap();
        fake.stdout.send(Bytes::from_static(b"2\r\nL3")).await.unwrap();
        drop(fake.stdout);

        assert_eq!(queue.recv().await.as_deref(), Some("L1"));
        assert_eq!(queue.recv().await.as_deref(), Some("L2"));
        assert_eq!(queue.recv().await.as_deref(), Some("L3"));

        fake.exit.send(Some(0)).unwrap();
        drop(fake.stderr);
        let status = session.status();
        assert_eq!(
            timeout(Duration::from_secs(1), status.terminal()).await.unwrap(),
            SessionState::Completed
        );

        // Completed sessions are not killed again
        assert_eq!(session.kill().await, SessionState::Completed);
        assert!(!fake.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_stderr_is_forwarded() {
        let (sink, mut queue) = outbound::channel(16);
        let (remote, fake) = remote();
        let _session = ActiveSession::start(remote, "logs", sink);

        fake.stderr.send(Bytes::from_static(b"E1\n")).await.unwrap();
        assert_eq!(queue.recv().await.as_deref(), Some("E1"));
    }

    #[tokio::test]
    async fn test_kill_cancels_remote_and_drops_pending_output() {
        let (sink, mut queue) = outbound::channel(16);
        let (remote, fake) = remote();
        let mut session = ActiveSession::start(remote, "logs", sink.clone());

        fake.stdout.send(Bytes::from_static(b"before\n")).await.unwrap();
        assert_eq!(queue.recv().await.as_deref(), Some("before"));

        let state = timeout(Duration::from_secs(1), session.kill()).await.unwrap();
        assert_eq!(state, SessionState::Killed);
        assert!(fake.cancel.is_cancelled());

        // Nothing from the killed session reaches the client any more
        let _ = fake.stdout.send(Bytes::from_static(b"after\n")).await;
        drop(sink);
        drop(session);
        assert_eq!(queue.recv().await, None);
    }

    #[tokio::test]
    async fn test_missing_exit_status_is_failure() {
        let (sink, _queue) = outbound::channel(16);
        let (remote, fake) = remote();
        let session = ActiveSession::start(remote, "logs", sink);

        drop(fake.exit);
        assert_eq!(
            timeout(Duration::from_secs(1), session.status().terminal()).await.unwrap(),
            SessionState::Failed
        );
    }
}
