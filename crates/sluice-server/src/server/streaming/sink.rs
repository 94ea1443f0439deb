//! Output channel abstraction for event streams.
//!
//! An [`EventSink`] is the append-only side of a stream. It has a definite
//! closed state: once the consumer is gone every write reports
//! [`Delivery::Closed`] instead of failing, so late results from in-flight
//! transforms are dropped without disturbing the run.

use core::future::Future;
use parking_lot::Mutex;
use sluice_core::event::StreamEvent;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outcome of a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The consumer is gone; the event was discarded.
    Closed,
}

/// Append-only destination for [`StreamEvent`]s, shared by all workers of a
/// run.
pub trait EventSink: Clone + Send + Sync + 'static {
    /// Appends an event, waiting for buffer space if the consumer is slow.
    fn send(&self, event: StreamEvent) -> impl Future<Output = Delivery> + Send;

    /// Returns `true` once the consumer has gone away.
    fn is_closed(&self) -> bool;
}

/// [`EventSink`] backed by a bounded Tokio channel.
///
/// The receiving half is owned by the HTTP response body. All clones share one
/// sender slot, so [`ChannelSink::close`] ends the body for every clone at
/// once, even while detached workers still hold theirs. Events already
/// buffered are still delivered before the body ends.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Arc<Mutex<Option<mpsc::Sender<StreamEvent>>>>,
}

impl ChannelSink {
    /// Opens a channel with room for `buffer` events.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Closes the sink for all clones. Later writes report
    /// [`Delivery::Closed`].
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

impl EventSink for ChannelSink {
    async fn send(&self, event: StreamEvent) -> Delivery {
        // Clone the sender out so the lock is not held while waiting for
        // buffer space.
        let Some(tx) = self.tx.lock().clone() else {
            return Delivery::Closed;
        };
        match tx.send(event).await {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().is_none_or(mpsc::Sender::is_closed)
    }
}
