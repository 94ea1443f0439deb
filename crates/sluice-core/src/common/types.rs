//! # Common Stream Types and Constants
//!
//! This module defines the request/response bodies, route paths and protocol
//! constants shared by the server and client. Keeping them in one place makes
//! the HTTP contract a compile-time agreement between both ends.
//!
//! ## Type Aliases
//!
//! - [`SessionId`] - The opaque token identifying a submitted item list
//!
//! ## Bodies
//!
//! - [`SubmitRequest`] / [`SubmitResponse`] - the submission endpoint
//! - [`StreamQuery`] - the query string of the streaming endpoint

use core::time::Duration;
use serde::{Deserialize, Serialize};

/// Opaque session identifier handed out by the submission endpoint.
pub type SessionId = String;

/// Route of the submission endpoint (`POST`) and prefix of the cancellation
/// endpoint (`DELETE {SESSIONS_PATH}/{id}`).
pub const SESSIONS_PATH: &str = "/api/sessions";

/// Route of the streaming endpoint (`GET`).
pub const STREAM_PATH: &str = "/api/stream";

/// Route of the health endpoint (`GET`).
pub const HEALTH_PATH: &str = "/health";

/// Name of the query parameter carrying the session identifier.
pub const SESSION_ID_PARAM: &str = "sessionId";

/// Media type of the streaming response.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Event name of the terminal signal.
pub const END_OF_STREAM_EVENT: &str = "end-of-stream";

/// Event name used to surface a failed run, when enabled on the server.
pub const ERROR_EVENT: &str = "error";

/// Default number of item transforms allowed in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default period between heartbeat comments.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Body of a submission request: an arbitrary list of work items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub items: Vec<serde_json::Value>,
}

/// Body of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub session_id: SessionId,
}

/// Query string of a streaming request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub session_id: SessionId,
}
