//! Errors returned by the client.

use sluice_core::decoder::DecodeError;

/// Boxed error produced by a custom record parser.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Transport failure: connect, read, or decoding a JSON response.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// A data payload could not be parsed into a record.
    #[error("Failed to parse payload {payload:?}: {reason}")]
    Parse { payload: String, reason: String },

    /// A parsed record carried no key.
    #[error("Record has no key: {payload:?}")]
    MissingKey { payload: String },

    /// The event stream could not be decoded.
    #[error("Malformed event stream: {0}")]
    Decode(#[from] DecodeError),

    /// The server reported a failed run with an `error` event.
    #[error("Stream failed on the server: {message}")]
    Remote { message: String },

    /// The connection ended before `end-of-stream`.
    #[error("Stream ended before end-of-stream")]
    UnexpectedEof,
}
