//! Session bookkeeping between submission and streaming.
//!
//! - [`registry`] - [`SessionRegistry`](registry::SessionRegistry), the
//!   injected in-memory session store

pub mod registry;
