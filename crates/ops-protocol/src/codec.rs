//! Line codec for process output
//!
//! Output from remote processes arrives as arbitrary byte chunks (pipe
//! reads on the agent, SSH channel data on the gateway). `LineCodec`
//! reassembles those chunks into text lines so each line can be sent as
//! its own frame.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Longest line emitted in one piece. Longer lines are split.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Codec splitting a byte stream on `\n`
///
/// - a trailing `\r` is dropped so CRLF output looks like LF output
/// - invalid UTF-8 is replaced instead of failing the stream
/// - on EOF a partial last line is still yielded
#[derive(Debug, Default)]
pub struct LineCodec {
    /// Index up to which the buffer is known to contain no newline
    next_index: usize,
}

impl LineCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { next_index: 0 }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len().min(MAX_LINE_LENGTH);

        if let Some(offset) = src[self.next_index..read_to]
            .iter()
            .position(|b| *b == b'\n')
        {
            let newline = self.next_index + offset;
            self.next_index = 0;
            let line = src.split_to(newline + 1);
            return Ok(Some(to_text(&line[..newline])));
        }

        if src.len() >= MAX_LINE_LENGTH {
            tracing::debug!("Line exceeds {} bytes, emitting it in pieces", MAX_LINE_LENGTH);
            self.next_index = 0;
            let piece = src.split_to(MAX_LINE_LENGTH);
            return Ok(Some(to_text(&piece)));
        }

        // Need more data
        self.next_index = read_to;
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }

        let rest = src.split_to(src.len());
        Ok(Some(to_text(&rest)))
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = line.as_ref();
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

fn to_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
