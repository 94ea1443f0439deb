use super::manager::RunState;
use crate::server::streaming::{
    sink::{Delivery, EventSink},
    transform::Transform,
};
use sluice_core::{Error, event::StreamEvent};
use std::sync::Arc;

/// Worker task pulling items from the shared queue until it is drained.
///
/// Each iteration dequeues the next item in input order, awaits its
/// transform, forwards a non-empty result to the sink and counts the item down.
/// The worker exits when the queue is empty or the run has been aborted.
///
/// # Arguments
///
/// - `worker_id`: Index of this worker within the pool (used for logs).
/// - `state`: Queue, countdown, transform and abort token shared by the run.
/// - `sink`: Destination for results.
///
/// # Behavior
///
/// - A transform error is recorded as the run's failure via
///   [`RunState::fail`], which cancels the run; the failed item is not
///   counted down, so the run can never complete successfully.
/// - Once the run is aborted, a result that is still in flight is discarded
///   rather than written.
/// - A closed sink is not an error: the result is dropped and the worker keeps
///   draining so every item is still accounted for.
pub async fn worker_loop<T, X, S>(worker_id: usize, state: Arc<RunState<T, X>>, sink: S)
where
    T: Send + 'static,
    X: Transform<T>,
    S: EventSink,
{
    tracing::trace!("Worker {worker_id} started");

    loop {
        if state.abort.is_cancelled() {
            tracing::debug!("Worker {worker_id} exiting after run was aborted");
            break;
        }
        let Some((position, item)) = state.queue.pop() else {
            break;
        };

        match state.transform.apply(item).await {
            Ok(Some(payload)) if !payload.is_empty() => {
                if state.abort.is_cancelled() {
                    tracing::debug!("Worker {worker_id} discarding item {position} from aborted run");
                    break;
                }
                match sink.send(StreamEvent::Data(payload)).await {
                    Delivery::Sent => state.record_emitted(),
                    Delivery::Closed => {
                        tracing::trace!("Worker {worker_id} dropped item {position}: sink closed");
                        state.record_discarded();
                    }
                }
            }
            Ok(_) => state.record_skipped(),
            Err(e) => {
                tracing::warn!("Worker {worker_id} failed on item {position}: {e}");
                state.fail(Error::Transform {
                    position,
                    reason: e.to_string(),
                });
                break;
            }
        }

        state.countdown.count_down();
    }

    tracing::trace!("Worker {worker_id} stopped");
}
