//! Incremental Server-Sent Events decoder.
//!
//! Network reads do not respect frame boundaries, so [`EventDecoder`] buffers
//! raw bytes until a full line is available and assembles lines into events
//! following the SSE field rules: `data` lines accumulate (joined with `\n`),
//! `event` sets the event name, lines starting with `:` are comments, and a
//! blank line dispatches the pending event. Bytes are only decoded as UTF-8
//! once a complete line is present, so a multi-byte character split across two
//! reads is never mangled.
//!
//! Lines may end with `\n` or `\r\n`. A line longer than the configured
//! limit is a [`DecodeError`], so a peer that never sends a newline cannot
//! grow the buffer without bound.

use crate::types::{END_OF_STREAM_EVENT, ERROR_EVENT};
use bytes::{Buf, BytesMut};

/// An event recovered from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// An unnamed (`message`) event carrying a data payload.
    Message(String),
    /// A comment line, which the server uses as a heartbeat.
    Heartbeat,
    /// The terminal `end-of-stream` event.
    EndOfStream,
    /// The terminal `error` event and its message.
    Error(String),
    /// Any other named event.
    Other { event: String, data: String },
}

/// Default limit on a single line, terminator excluded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Event stream line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

/// Stateful decoder turning arbitrary byte chunks into [`Received`] events.
#[derive(Debug)]
pub struct EventDecoder {
    pending: BytesMut,
    max_line: usize,
    event: Option<String>,
    data: String,
    has_data: bool,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a decoder rejecting lines longer than `max_line` bytes.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            max_line,
            event: None,
            data: String::new(),
            has_data: false,
        }
    }

    /// Feeds a chunk of bytes and returns every event completed by it.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::LineTooLong`] once a line, complete or still
    /// buffered, exceeds the limit. The decoder should not be reused after
    /// an error.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Received>, DecodeError> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line = self.pending.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if line.len() > self.max_line {
                return Err(self.too_long());
            }
            let line = String::from_utf8_lossy(line.chunk()).into_owned();
            if let Some(received) = self.process_line(&line) {
                out.push(received);
            }
        }

        // A trailing `\r` may still be followed by `\n`.
        if self.pending.len() > self.max_line + 1 {
            return Err(self.too_long());
        }
        Ok(out)
    }

    /// Bytes buffered that do not yet form a complete line.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    fn too_long(&mut self) -> DecodeError {
        self.pending.clear();
        DecodeError::LineTooLong {
            limit: self.max_line,
        }
    }

    fn process_line(&mut self, line: &str) -> Option<Received> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return Some(Received::Heartbeat);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            // `id` and `retry` only matter for reconnection, which is not
            // supported.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Received> {
        let event = self.event.take();
        let data = core::mem::take(&mut self.data);
        if !core::mem::take(&mut self.has_data) {
            return None;
        }

        Some(match event.as_deref() {
            None | Some("message") => Received::Message(data),
            Some(END_OF_STREAM_EVENT) => Received::EndOfStream,
            Some(ERROR_EVENT) => Received::Error(data),
            Some(_) => Received::Other {
                event: event.unwrap_or_default(),
                data,
            },
        })
    }
}
