//! # Shared Stream Contract
//!
//! Everything both ends of a sluice stream must agree on lives here.
//!
//! - [`event`] - the [`StreamEvent`](event::StreamEvent) model and its SSE
//!   encoding
//! - [`decoder`] - incremental SSE frame decoding for consumers
//! - [`types`] - request/response bodies, identifiers and shared constants
//! - [`error`] - the unified [`Error`] type

pub mod decoder;
pub mod error;
pub mod event;
pub mod types;

pub use error::{Error, Result};
