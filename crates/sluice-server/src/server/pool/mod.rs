//! Bounded worker pool for draining a list of work items.
//!
//! - [`manager`] - [`WorkerPool`](manager::WorkerPool), owner of one run
//! - [`worker`] - the per-worker dequeue/transform/emit loop
//! - [`queue`] - FIFO queue shared by the workers
//! - [`countdown`] - completion counter the coordinator waits on

pub mod countdown;
pub mod manager;
pub mod queue;
pub mod worker;
