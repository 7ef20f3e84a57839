//! Core domain types

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle of one remote command invocation
///
/// ```text
/// Created -> Running -> Completed | Killed | Failed
/// Created -> Failed
/// ```
///
/// Terminal states absorb every further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Dispatched, process not yet started
    Created,
    /// Process is running and streaming output
    Running,
    /// Process exited on its own
    Completed,
    /// Process was terminated by cancellation
    Killed,
    /// Spawn failed or the process ended abnormally
    Failed,
}

impl SessionState {
    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Killed | SessionState::Failed
        )
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Created, SessionState::Running)
                | (SessionState::Created, SessionState::Failed)
                | (SessionState::Running, SessionState::Completed)
                | (SessionState::Running, SessionState::Killed)
                | (SessionState::Running, SessionState::Failed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Running => write!(f, "running"),
            SessionState::Completed => write!(f, "completed"),
            SessionState::Killed => write!(f, "killed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Shared, observable session state
///
/// Cloned into every task of a session. Transitions are checked with
/// [`SessionState::can_transition_to`] so racing paths (natural exit vs.
/// kill) resolve to exactly one terminal state.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    tx: Arc<watch::Sender<SessionState>>,
}

impl SessionStatus {
    /// Create a status in `Created`
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Created);
        Self { tx: Arc::new(tx) }
    }

    /// Current state
    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Attempt a transition. Returns false if it is not legal from the
    /// current state.
    pub fn transition(&self, next: SessionState) -> bool {
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Wait until the session reaches a terminal state
    pub async fn terminal(&self) -> SessionState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            // Sender lives as long as `self`
            Err(_) => self.get(),
        };
        state
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Which process output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Pseudo-terminal parameters sent with a session request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyRequest {
    /// Terminal type (exported as `TERM` on the agent)
    pub term: String,
    /// Width in columns
    pub cols: u32,
    /// Height in rows
    pub rows: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 120,
        }
    }
}
