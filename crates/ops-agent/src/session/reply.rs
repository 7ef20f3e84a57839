//! Where a session's output goes

use async_trait::async_trait;
use bytes::BytesMut;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use thiserror::Error;
use tokio_util::codec::Encoder;

use ops_core::StreamKind;
use ops_protocol::LineCodec;

/// SSH extended data type for stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// The remote side is gone
#[derive(Debug, Error)]
#[error("Session channel closed")]
pub struct ReplyClosed;

/// Destination of one session's output
#[async_trait]
pub trait ReplySink: Send + Sync + 'static {
    /// Write one line to the stream of the given kind
    async fn send_line(&self, stream: StreamKind, line: &str) -> Result<(), ReplyClosed>;

    /// Report the exit status and end the channel
    async fn finish(&self, exit_status: u32);
}

/// Replies over an SSH channel: stdout as channel data, stderr as
/// extended data, then exit-status, EOF and close.
#[derive(Clone)]
pub struct ChannelReply {
    handle: Handle,
    channel: ChannelId,
}

impl ChannelReply {
    /// Reply on `channel`
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

#[async_trait]
impl ReplySink for ChannelReply {
    async fn send_line(&self, stream: StreamKind, line: &str) -> Result<(), ReplyClosed> {
        let mut buf = BytesMut::with_capacity(line.len() + 1);
        LineCodec::new()
            .encode(line, &mut buf)
            .map_err(|_| ReplyClosed)?;
        let data = CryptoVec::from_slice(&buf);

        let result = match stream {
            StreamKind::Stdout => self.handle.data(self.channel, data).await,
            StreamKind::Stderr => {
                self.handle
                    .extended_data(self.channel, SSH_EXTENDED_DATA_STDERR, data)
                    .await
            }
        };
        result.map_err(|_| ReplyClosed)
    }

    async fn finish(&self, exit_status: u32) {
        if self
            .handle
            .exit_status_request(self.channel, exit_status)
            .await
            .is_err()
        {
            tracing::debug!("Channel {:?} gone before exit status", self.channel);
            return;
        }
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}
