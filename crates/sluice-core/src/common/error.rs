//! Error types for the streaming service.
//!
//! This module defines the central `Error` enum, which captures all recoverable
//! and reportable error cases within a sluice deployment. It implements
//! [`IntoResponse`] so handlers can return it directly and have it rendered as
//! an HTTP status with a small JSON body (`{"error": "..."}`).
//!
//! ## Error Cases
//! - `SessionNotFound`: A stream or cancel request named an unknown session.
//! - `InvalidRequest`: The client request was malformed or exceeded bounds.
//! - `Transform`: A work item's transform failed and aborted the run.
//! - `WorkerPanicked`: A worker task panicked while processing items.
//! - `ChannelError`: An internal communication failure between tasks.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the streaming service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// No live session is registered under the requested identifier.
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The transform for the item at `position` failed.
    #[error("Transform failed for item {position}: {reason}")]
    Transform { position: usize, reason: String },

    /// A worker task panicked before settling its current item.
    #[error("Worker {worker} panicked")]
    WorkerPanicked { worker: usize },

    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// HTTP status used when this error is surfaced as a response.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Transform { .. } | Self::WorkerPanicked { .. } | Self::ChannelError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ServiceShutdown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() }).to_string();
        (
            self.status(),
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_http_status() {
        let not_found = Error::SessionNotFound { id: "abc".into() };
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.to_string(), "Session not found: abc");

        let invalid = Error::InvalidRequest {
            reason: "too many items".into(),
        };
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let transform = Error::Transform {
            position: 2,
            reason: "boom".into(),
        };
        assert_eq!(transform.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(transform.to_string(), "Transform failed for item 2: boom");

        assert_eq!(
            Error::ServiceShutdown.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn renders_json_error_body() {
        let response = Error::SessionNotFound { id: "abc".into() }.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
