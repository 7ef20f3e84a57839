//! Per-client outbound line queue
//!
//! Every line is tagged with the session that produced it. The receiving
//! end only yields lines of the session that is currently active, so
//! output of a superseded session still sitting in the queue is dropped
//! instead of reaching the client.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use ops_protocol::SessionId;

/// The client side of the queue is gone
#[derive(Debug, Error)]
#[error("Outbound queue closed")]
pub struct OutboundClosed;

#[derive(Debug)]
struct OutboundLine {
    session: SessionId,
    line: String,
}

/// Sending half, cloned into every forwarder
#[derive(Debug, Clone)]
pub struct OutboundSink {
    tx: mpsc::Sender<OutboundLine>,
    active: Arc<watch::Sender<Option<SessionId>>>,
}

/// Receiving half, owned by the connection writer
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<OutboundLine>,
    active: watch::Receiver<Option<SessionId>>,
}

/// Create a queue holding up to `capacity` lines
pub fn channel(capacity: usize) -> (OutboundSink, OutboundQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (active_tx, active_rx) = watch::channel(None);

    (
        OutboundSink {
            tx,
            active: Arc::new(active_tx),
        },
        OutboundQueue {
            rx,
            active: active_rx,
        },
    )
}

impl OutboundSink {
    /// Make `session` the one whose lines are delivered
    pub fn activate(&self, session: SessionId) {
        self.active.send_replace(Some(session));
    }

    /// Stop delivering lines of `session` if it is the active one
    pub fn deactivate(&self, session: SessionId) {
        self.active.send_if_modified(|active| {
            if *active == Some(session) {
                *active = None;
                true
            } else {
                false
            }
        });
    }

    /// Queue a line, waiting for space
    pub async fn send(&self, session: SessionId, line: String) -> Result<(), OutboundClosed> {
        self.tx
            .send(OutboundLine { session, line })
            .await
            .map_err(|_| OutboundClosed)
    }
}

impl OutboundQueue {
    /// Next line of the active session; `None` once every sink is gone
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            let OutboundLine { session, line } = self.rx.recv().await?;
            if *self.active.borrow() == Some(session) {
                return Some(line);
            }
            tracing::trace!("Dropping stale line from {}", session);
        }
    }
}
