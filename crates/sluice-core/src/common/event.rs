//! Stream events and their Server-Sent Events encoding.
//!
//! A stream is a sequence of [`StreamEvent`]s: any number of `Data` and
//! `Heartbeat` events, followed by at most one terminal event. Each event
//! encodes to a self-contained SSE frame terminated by a blank line, so frames
//! can be written to the response body independently.
//!
//! Frames are built here rather than with `axum::response::sse::Event`, which
//! writes no `data` field at all for an empty payload. SSE clients never
//! dispatch such an event, and `end-of-stream` relies on an empty `data`
//! field.

use crate::types::{END_OF_STREAM_EVENT, ERROR_EVENT};
use bytes::{BufMut, Bytes, BytesMut};

/// A single unit written to an event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A caller-serialized result payload.
    Data(String),
    /// A content-free comment that keeps intermediaries from idling out the
    /// connection.
    Heartbeat,
    /// The terminal signal of a successful run.
    EndOfStream,
    /// The terminal signal of a failed run. Only written when the server is
    /// configured to surface failures on the wire.
    Error(String),
}

impl StreamEvent {
    /// Returns `true` for events after which nothing else may be written.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::Error(_))
    }

    /// Encodes this event as an SSE frame.
    ///
    /// Multi-line payloads become one `data:` field per line, which SSE
    /// consumers join back together with `\n`. `\r\n`, `\r` and `\n` all
    /// break lines, and a trailing break yields a final empty field so the
    /// payload survives the round trip unchanged apart from `\r\n` and `\r`
    /// turning into `\n`.
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Data(payload) => encode_fields(None, payload),
            Self::Heartbeat => Bytes::from_static(b":\n\n"),
            Self::EndOfStream => encode_fields(Some(END_OF_STREAM_EVENT), ""),
            Self::Error(message) => encode_fields(Some(ERROR_EVENT), message),
        }
    }
}

fn encode_fields(event: Option<&str>, data: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 32);
    if let Some(name) = event {
        buf.put_slice(b"event: ");
        buf.put_slice(name.as_bytes());
        buf.put_u8(b'\n');
    }
    for line in data_lines(data) {
        buf.put_slice(b"data: ");
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
    }
    buf.put_u8(b'\n');
    buf.freeze()
}

/// Splits on every SSE line terminator, keeping empty lines. Unlike
/// [`str::lines`], a trailing terminator produces a final empty line.
fn data_lines(data: &str) -> impl Iterator<Item = &str> {
    data.split('\n').flat_map(|line| {
        line.strip_suffix('\r')
            .unwrap_or(line)
            .split('\r')
    })
}
