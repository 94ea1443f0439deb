//! HTTP service: session submission, event streams and health.
//!
//! This module ties the session registry and the item processor to the HTTP
//! surface. A submission stores its items and returns a session id; a stream
//! request for that id consumes the session and answers with a
//! `text/event-stream` body fed by a background processing run.
//!
//! ## Structure
//!
//! - [`handler`] - [`StreamService`](handler::StreamService) and its axum
//!   router.
//! - [`config`] - item and transform types used by the binary.

pub mod config;
pub mod handler;
