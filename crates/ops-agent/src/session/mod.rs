//! Agent-side execution sessions
//!
//! One session per exec request: resolve the token, start the process,
//! forward its output line by line and tear it down when the channel
//! goes away.

mod reply;

pub use reply::{ChannelReply, ReplyClosed, ReplySink};

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use ops_core::error::StreamError;
use ops_core::{SessionState, SessionStatus, StreamKind};
use ops_protocol::{unknown_command_reply, CommandToken, ProtocolError, SessionId};

use crate::command::{CommandSpec, CommandTable, Dispatch, CLEAR_SCREEN};

/// Exit status reported when the process could not be started
pub const EXIT_SPAWN_FAILED: u32 = 127;

/// Serve one request on one channel
///
/// Returns the final state of the execution session, or `None` when the
/// request never created one (empty or unknown command).
pub async fn serve<R: ReplySink>(
    id: SessionId,
    request: Option<CommandToken>,
    commands: &CommandTable,
    reply: Arc<R>,
    env: Vec<(String, String)>,
    cancel: CancellationToken,
) -> Option<SessionState> {
    match commands.dispatch(request) {
        Dispatch::Empty => {
            tracing::debug!("{}: empty command", id);
            reply.finish(0).await;
            None
        }
        Dispatch::Unknown(token) => {
            tracing::info!("{}: unknown command {:?}", id, token.name());
            let _ = reply
                .send_line(StreamKind::Stdout, &unknown_command_reply(token.name()))
                .await;
            reply.finish(0).await;
            None
        }
        Dispatch::Run { token, spec } => {
            if !token.ignored_args().is_empty() {
                tracing::debug!("{}: ignoring arguments {:?}", id, token.ignored_args());
            }
            let session = ExecutionSession::new(id, token.name(), cancel);
            Some(session.run(spec, env, reply).await)
        }
    }
}

/// A running allow-listed command bound to one channel
pub struct ExecutionSession {
    id: SessionId,
    command: String,
    status: SessionStatus,
    cancel: CancellationToken,
}

impl ExecutionSession {
    /// Create a session in `Created`
    pub fn new(id: SessionId, command: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            id,
            command: command.into(),
            status: SessionStatus::new(),
            cancel,
        }
    }

    /// Observable state
    pub fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    /// Run to completion or cancellation
    pub async fn run<R: ReplySink>(
        self,
        spec: &CommandSpec,
        env: Vec<(String, String)>,
        reply: Arc<R>,
    ) -> SessionState {
        let mut runner = spec.runner();
        for (key, value) in env {
            runner = runner.env(key, value);
        }

        let mut process = match runner.start() {
            Ok(process) => process,
            Err(e) => {
                tracing::error!("{}: {}", self.id, e);
                self.status.transition(SessionState::Failed);
                reply.finish(EXIT_SPAWN_FAILED).await;
                return self.status.get();
            }
        };

        self.status.transition(SessionState::Running);
        tracing::info!(
            "{}: started {} (pid {:?})",
            self.id,
            self.command,
            process.pid()
        );

        let mut forwarders = JoinSet::new();
        if let Some(stdout) = process.take_stdout() {
            forwarders.spawn(forward(
                self.id,
                StreamKind::Stdout,
                stdout,
                spec.repaint_on.clone(),
                Arc::clone(&reply),
                self.cancel.clone(),
            ));
        }
        if let Some(stderr) = process.take_stderr() {
            forwarders.spawn(forward(
                self.id,
                StreamKind::Stderr,
                stderr,
                None,
                Arc::clone(&reply),
                self.cancel.clone(),
            ));
        }

        let exit_status = tokio::select! {
            result = process.wait() => {
                // Output written before exit still has to go out
                while forwarders.join_next().await.is_some() {}

                match result {
                    Ok(status) => {
                        self.status.transition(SessionState::Completed);
                        tracing::info!("{}: {} exited with {}", self.id, self.command, status);
                        status.code().map(|code| code as u32).unwrap_or(0)
                    }
                    Err(e) => {
                        self.status.transition(SessionState::Failed);
                        tracing::warn!("{}: {}", self.id, e);
                        e.exit_code()
                    }
                }
            }
            _ = self.cancel.cancelled() => {
                process.kill();
                if let Err(e) = process.wait().await {
                    tracing::debug!("{}: {}", self.id, e);
                }
                forwarders.shutdown().await;
                self.status.transition(SessionState::Killed);
                tracing::info!("{}: {} killed", self.id, self.command);
                return self.status.get();
            }
        };

        reply.finish(exit_status).await;
        self.status.get()
    }
}

/// Copy lines from one process stream to the reply sink, clearing the
/// screen ahead of lines that start with `repaint_on`
async fn forward<S, R>(
    id: SessionId,
    kind: StreamKind,
    mut lines: S,
    repaint_on: Option<String>,
    reply: Arc<R>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<String, ProtocolError>> + Unpin,
    R: ReplySink,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next() => next,
        };

        match next {
            Some(Ok(line)) => {
                let repaint = repaint_on
                    .as_deref()
                    .is_some_and(|prefix| line.starts_with(prefix));
                if repaint {
                    if let Err(e) = reply.send_line(kind, CLEAR_SCREEN).await {
                        tracing::debug!("{}: {} ({})", id, e, kind);
                        break;
                    }
                }
                if let Err(e) = reply.send_line(kind, &line).await {
                    tracing::debug!("{}: {} ({})", id, e, kind);
                    break;
                }
            }
            Some(Err(source)) => {
                let err = StreamError::Read { stream: kind, source };
                tracing::warn!("{}: {}", id, err);
                break;
            }
            None => break,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::time::timeout;

    #[derive(Default)]
    struct RecordingReply {
        lines: Mutex<Vec<(StreamKind, String)>>,
        exit: Mutex<Option<u32>>,
    }

    impl RecordingReply {
        async fn lines(&self, kind: StreamKind) -> Vec<String> {
            self.lines
                .lock()
                .await
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, line)| line.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl ReplySink for RecordingReply {
        async fn send_line(&self, stream: StreamKind, line: &str) -> Result<(), ReplyClosed> {
            self.lines.lock().await.push((stream, line.to_string()));
            Ok(())
        }

        async fn finish(&self, exit_status: u32) {
            *self.exit.lock().await = Some(exit_status);
        }
    }

    fn table() -> CommandTable {
        CommandTable::new()
            .with(
                "logs",
                CommandSpec::new("sh", ["-c", "printf 'L1\\nL2\\nL3\\n'; printf 'E1\\n' >&2"]),
            )
            .with("hang", CommandSpec::new("sleep", ["30"]))
            .with("fail", CommandSpec::new("sh", ["-c", "exit 3"]))
            .with("term", CommandSpec::new("sh", ["-c", "echo $TERM"]))
            .with(
                "screens",
                CommandSpec::new("sh", ["-c", "printf 'top - 1\\nrow\\ntop - 2\\nrow\\n'"])
                    .repaint_on("top -"),
            )
            .with(
                "missing",
                CommandSpec::new("/nonexistent/ops-agent-test-binary", Vec::<String>::new()),
            )
    }

    async fn run(command: &str, env: Vec<(String, String)>) -> (Option<SessionState>, Arc<RecordingReply>) {
        let reply = Arc::new(RecordingReply::default());
        let state = serve(
            SessionId::next(),
            CommandToken::parse(command.as_bytes()),
            &table(),
            Arc::clone(&reply),
            env,
            CancellationToken::new(),
        )
        .await;
        (state, reply)
    }

    #[tokio::test]
    async fn test_forwards_lines_then_exit_status() {
        let (state, reply) = run("logs", Vec::new()).await;

        assert_eq!(state, Some(SessionState::Completed));
        assert_eq!(reply.lines(StreamKind::Stdout).await, vec!["L1", "L2", "L3"]);
        assert_eq!(reply.lines(StreamKind::Stderr).await, vec!["E1"]);
        assert_eq!(*reply.exit.lock().await, Some(0));
    }

    #[tokio::test]
    async fn test_repainting_command_clears_each_screen() {
        let (state, reply) = run("screens", Vec::new()).await;

        assert_eq!(state, Some(SessionState::Completed));
        assert_eq!(
            reply.lines(StreamKind::Stdout).await,
            vec![CLEAR_SCREEN, "top - 1", "row", CLEAR_SCREEN, "top - 2", "row"]
        );
    }

    #[tokio::test]
    async fn test_unknown_command_gets_one_line() {
        let (state, reply) = run("foo bar", Vec::new()).await;

        assert_eq!(state, None);
        assert_eq!(
            *reply.lines.lock().await,
            vec![(StreamKind::Stdout, "foo <- Unknown command.".to_string())]
        );
        assert_eq!(*reply.exit.lock().await, Some(0));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let (state, reply) = run("   ", Vec::new()).await;

        assert_eq!(state, None);
        assert!(reply.lines.lock().await.is_empty());
        assert_eq!(*reply.exit.lock().await, Some(0));
    }

    #[tokio::test]
    async fn test_nonzero_exit_completes() {
        let (state, reply) = run("fail", Vec::new()).await;

        assert_eq!(state, Some(SessionState::Completed));
        assert_eq!(*reply.exit.lock().await, Some(3));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (state, reply) = run("missing", Vec::new()).await;

        assert_eq!(state, Some(SessionState::Failed));
        assert_eq!(*reply.exit.lock().await, Some(EXIT_SPAWN_FAILED));
    }

    #[tokio::test]
    async fn test_env_reaches_process() {
        let (_, reply) = run("term", vec![("TERM".into(), "vt100".into())]).await;
        assert_eq!(reply.lines(StreamKind::Stdout).await, vec!["vt100"]);
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let reply = Arc::new(RecordingReply::default());
        let cancel = CancellationToken::new();
        let table = table();

        let session = ExecutionSession::new(SessionId::next(), "hang", cancel.clone());
        let status = session.status();
        let spec = table.get("hang").unwrap().clone();
        let task = tokio::spawn({
            let reply = Arc::clone(&reply);
            async move { session.run(&spec, Vec::new(), reply).await }
        });

        let mut watch = status.subscribe();
        timeout(Duration::from_secs(5), watch.wait_for(|s| *s == SessionState::Running))
            .await
            .unwrap()
            .unwrap();

        cancel.cancel();
        let state = timeout(Duration::from_secs(5), task)
            .await
            .expect("cancelled session should end promptly")
            .unwrap();

        assert_eq!(state, SessionState::Killed);
        // Nobody is listening after a cancel
        assert_eq!(*reply.exit.lock().await, None);
    }
}
