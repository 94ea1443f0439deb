//! Streaming a processed item list to an output sink.
//!
//! - [`coordinator`] - [`process_items`](coordinator::process_items), the
//!   concurrent item processor with heartbeats and the terminal event
//! - [`sink`] - the [`EventSink`](sink::EventSink) output abstraction
//! - [`transform`] - per-item work and the default echo transform

pub mod coordinator;
pub mod sink;
pub mod transform;
