//! Bounded worker pool draining a shared work queue.
//!
//! This module defines [`WorkerPool`], which owns one run of the item
//! processor: the FIFO [`WorkQueue`], a [`Countdown`] of unsettled items, and
//! up to `concurrency` worker tasks pulling from the queue. Each worker has at
//! most one transform in flight, which is what bounds concurrency.
//!
//! Failure handling is cooperative. The first failing worker records its
//! error and cancels the run's [`CancellationToken`]; siblings finish the
//! transform they are awaiting, discard its result and stop dequeuing. Nothing
//! is aborted mid-transform.

use super::{countdown::Countdown, queue::WorkQueue, worker::worker_loop};
use crate::server::streaming::{sink::EventSink, transform::Transform};
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use sluice_core::Error;
use std::{collections::HashMap, sync::Arc};
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;

/// State shared between the pool and its workers for a single run.
pub struct RunState<T, X> {
    pub queue: WorkQueue<T>,
    pub countdown: Countdown,
    pub transform: X,
    pub abort: CancellationToken,
    failure: Mutex<Option<Error>>,
    emitted: AtomicUsize,
    skipped: AtomicUsize,
    discarded: AtomicUsize,
}

impl<T, X> RunState<T, X> {
    fn new(items: Vec<T>, transform: X) -> Self {
        let total = items.len();
        Self {
            queue: WorkQueue::new(items),
            countdown: Countdown::new(total),
            transform,
            abort: CancellationToken::new(),
            failure: Mutex::new(None),
            emitted: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
        }
    }

    /// Records `err` as the reason the run failed and stops all workers. Only
    /// the first failure is kept.
    pub fn fail(&self, err: Error) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.abort.cancel();
    }

    fn take_failure(&self) -> Error {
        self.failure.lock().take().unwrap_or(Error::ChannelError {
            context: "run aborted without a recorded failure".to_string(),
        })
    }

    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters describing what a run produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Results written to the sink.
    pub emitted: usize,
    /// Items whose transform produced nothing.
    pub skipped: usize,
    /// Results dropped because the sink was already closed.
    pub discarded: usize,
}

/// A pool of worker tasks processing one list of items.
pub struct WorkerPool<T, X> {
    state: Arc<RunState<T, X>>,
    workers: JoinSet<()>,
    worker_ids: HashMap<task::Id, usize>,
}

impl<T, X> WorkerPool<T, X>
where
    T: Send + 'static,
    X: Transform<T>,
{
    /// Spawns `min(concurrency, items.len())` workers draining `items`
    /// through `transform` into `sink`.
    pub fn spawn<S: EventSink>(items: Vec<T>, transform: X, sink: S, concurrency: usize) -> Self {
        let num_workers = concurrency.min(items.len());
        let state = Arc::new(RunState::new(items, transform));
        let mut workers = JoinSet::new();
        let mut worker_ids = HashMap::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let handle = workers.spawn(worker_loop(worker_id, Arc::clone(&state), sink.clone()));
            worker_ids.insert(handle.id(), worker_id);
        }

        tracing::debug!(workers = num_workers, "Worker pool started");

        Self {
            state,
            workers,
            worker_ids,
        }
    }

    /// Waits until every item has settled.
    ///
    /// Cancel safe: dropping the returned future loses no completions, so it
    /// can be polled inside `tokio::select!` alongside a heartbeat timer.
    ///
    /// # Errors
    ///
    /// Returns the first failure recorded by a worker, or
    /// [`Error::WorkerPanicked`] if a worker task panicked.
    pub async fn join(&mut self) -> Result<(), Error> {
        loop {
            tokio::select! {
                biased;
                () = self.state.abort.cancelled() => return Err(self.state.take_failure()),
                () = self.state.countdown.wait() => return Ok(()),
                Some(joined) = self.workers.join_next() => {
                    if let Err(e) = joined {
                        let worker = self.worker_ids.get(&e.id()).copied().unwrap_or_default();
                        tracing::error!("Worker {worker} terminated abnormally: {e}");
                        self.state.fail(Error::WorkerPanicked { worker });
                    }
                }
            }
        }
    }

    /// Waits for the already-drained workers to exit.
    pub async fn shutdown(mut self) {
        while self.workers.join_next().await.is_some() {}
    }

    /// Lets the remaining workers finish their in-flight transforms in the
    /// background. Their results are discarded.
    pub fn detach(mut self) {
        self.workers.detach_all();
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            emitted: self.state.emitted.load(Ordering::Relaxed),
            skipped: self.state.skipped.load(Ordering::Relaxed),
            discarded: self.state.discarded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::streaming::{sink::testing::RecordingSink, transform::TransformResult};

    #[tokio::test]
    async fn empty_input_spawns_no_workers() {
        let transform = |_: u32| async { TransformResult::Ok(None) };
        let mut pool = WorkerPool::spawn(Vec::new(), transform, RecordingSink::default(), 4);
        pool.join().await.unwrap();
        assert_eq!(pool.stats(), RunStats::default());
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reports_first_failure() {
        let transform = |n: u32| async move {
            if n == 2 {
                TransformResult::Err("bad item".into())
            } else {
                TransformResult::Ok(Some(n.to_string()))
            }
        };
        let mut pool = WorkerPool::spawn(vec![0, 1, 2, 3], transform, RecordingSink::default(), 1);
        let err = pool.join().await.unwrap_err();
        assert_eq!(
            err,
            Error::Transform {
                position: 2,
                reason: "bad item".into()
            }
        );
        pool.detach();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn surfaces_worker_panics() {
        let transform = |n: u32| async move {
            if n == 1 {
                panic!("transform blew up");
            }
            TransformResult::Ok(None)
        };
        let mut pool = WorkerPool::spawn(vec![0, 1], transform, RecordingSink::default(), 2);
        let err = pool.join().await.unwrap_err();
        assert!(matches!(err, Error::WorkerPanicked { .. }));
        pool.detach();
    }
}
