use super::{
    sink::{Delivery, EventSink},
    transform::Transform,
};
use crate::server::pool::manager::{RunStats, WorkerPool};
use core::time::Duration;
use sluice_core::{
    Error,
    event::StreamEvent,
    types::{DEFAULT_CONCURRENCY, DEFAULT_HEARTBEAT_INTERVAL},
};
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Tuning for a single processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Maximum number of transforms in flight at once.
    pub concurrency: usize,
    /// Period between heartbeat comments while the run is active.
    pub heartbeat_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl ProcessorConfig {
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if either value is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.concurrency == 0 {
            return Err(Error::InvalidRequest {
                reason: "Concurrency must be greater than 0".to_string(),
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::InvalidRequest {
                reason: "Heartbeat interval must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// What a successful run wrote to its sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub items: usize,
    pub emitted: usize,
    pub skipped: usize,
    pub discarded: usize,
    pub heartbeats: usize,
}

/// Drains `items` through `transform` with bounded concurrency, streaming
/// results into `sink`.
///
/// This is the core of a stream: it spawns a [`WorkerPool`] of at most
/// `config.concurrency` workers, writes a [`StreamEvent::Heartbeat`] every
/// `config.heartbeat_interval` while items are outstanding, and writes exactly
/// one [`StreamEvent::EndOfStream`] once every item has settled.
///
/// # Arguments
///
/// - `items`: Work items, dequeued in input order.
/// - `transform`: Async per-item work. `Ok(None)` or an empty string emits
///   nothing.
/// - `sink`: Output channel shared by all workers.
/// - `config`: Concurrency limit and heartbeat period.
///
/// # Behavior
///
/// - Results are written in completion order, not input order.
/// - The first heartbeat fires one interval after the run starts; the timer is
///   dropped as soon as the run settles, so no heartbeat follows the terminal
///   event.
/// - A closed sink turns writes into no-ops; the run still processes every
///   item.
///
/// # Errors
///
/// - [`Error::InvalidRequest`] if `config` is invalid.
/// - The first [`Error::Transform`] raised by any item, or
///   [`Error::WorkerPanicked`]. No terminal event is written in that case and
///   the remaining workers are left to settle in the background.
#[tracing::instrument(skip_all, fields(items = items.len(), concurrency = config.concurrency))]
pub async fn process_items<T, X, S>(
    items: Vec<T>,
    transform: X,
    sink: S,
    config: ProcessorConfig,
) -> Result<ProcessSummary, Error>
where
    T: Send + 'static,
    X: Transform<T>,
    S: EventSink,
{
    config.validate()?;

    let total = items.len();
    let mut pool = WorkerPool::spawn(items, transform, sink.clone(), config.concurrency);

    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeats = 0;

    let outcome = loop {
        tokio::select! {
            biased;
            res = pool.join() => break res,
            _ = heartbeat.tick() => {
                if sink.send(StreamEvent::Heartbeat).await == Delivery::Sent {
                    heartbeats += 1;
                }
            }
        }
    };
    drop(heartbeat);

    match outcome {
        Ok(()) => {
            let RunStats {
                emitted,
                skipped,
                discarded,
            } = pool.stats();
            pool.shutdown().await;

            if sink.send(StreamEvent::EndOfStream).await == Delivery::Closed {
                tracing::debug!("Consumer gone before end of stream");
            }
            tracing::debug!(emitted, skipped, discarded, heartbeats, "Run complete");

            Ok(ProcessSummary {
                items: total,
                emitted,
                skipped,
                discarded,
                heartbeats,
            })
        }
        Err(e) => {
            tracing::warn!("Run aborted: {e}");
            pool.detach();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::streaming::{
        sink::{ChannelSink, testing::RecordingSink},
        transform::TransformResult,
    };
    use parking_lot::Mutex;
    use portable_atomic::{AtomicUsize, Ordering};
    use std::{collections::HashMap, sync::Arc};

    fn config(concurrency: usize, heartbeat_ms: u64) -> ProcessorConfig {
        ProcessorConfig {
            concurrency,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
        }
    }

    /// Tracks how many transforms are pending at once and how often each
    /// item was seen.
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        seen: Mutex<HashMap<usize, usize>>,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn transforms_each_item_once_within_concurrency_limit() {
        const ITEMS: usize = 200;
        const LIMIT: usize = 7;

        let gauge = Arc::new(Gauge::default());
        let transform = {
            let gauge = Arc::clone(&gauge);
            move |n: usize| {
                let gauge = Arc::clone(&gauge);
                async move {
                    let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
                    gauge.peak.fetch_max(now, Ordering::SeqCst);
                    *gauge.seen.lock().entry(n).or_default() += 1;
                    tokio::time::sleep(Duration::from_micros((n % 5) as u64 * 200)).await;
                    gauge.current.fetch_sub(1, Ordering::SeqCst);
                    TransformResult::Ok(Some(n.to_string()))
                }
            }
        };

        let sink = RecordingSink::default();
        let summary = process_items((0..ITEMS).collect(), transform, sink.clone(), config(LIMIT, 5))
            .await
            .unwrap();

        assert_eq!(summary.items, ITEMS);
        assert_eq!(summary.emitted, ITEMS);
        assert!(gauge.peak.load(Ordering::SeqCst) <= LIMIT);
        let seen = gauge.seen.lock();
        assert_eq!(seen.len(), ITEMS);
        assert!(seen.values().all(|&count| count == 1));

        let mut data: Vec<usize> = sink.data().iter().map(|s| s.parse().unwrap()).collect();
        data.sort_unstable();
        assert_eq!(data, (0..ITEMS).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn writes_single_end_of_stream_after_all_data() {
        let transform = |s: &'static str| async move { TransformResult::Ok(Some(s.to_string())) };
        let sink = RecordingSink::default();
        process_items(vec!["a", "b", "c"], transform, sink.clone(), config(1, 100))
            .await
            .unwrap();

        let events = sink.events();
        assert_eq!(
            events,
            vec![
                StreamEvent::Data("a".into()),
                StreamEvent::Data("b".into()),
                StreamEvent::Data("c".into()),
                StreamEvent::EndOfStream,
            ]
        );
        assert_eq!(sink.count(&StreamEvent::EndOfStream), 1);
    }

    #[tokio::test]
    async fn skips_empty_results() {
        let transform = |n: u8| async move {
            TransformResult::Ok(match n {
                0 => None,
                1 => Some(String::new()),
                _ => Some("kept".into()),
            })
        };
        let sink = RecordingSink::default();
        let summary = process_items(vec![0, 1, 2], transform, sink.clone(), config(3, 100))
            .await
            .unwrap();
        assert_eq!(summary.emitted, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(sink.data(), vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn empty_input_ends_immediately() {
        let transform = |_: u8| async { TransformResult::Ok(None) };
        let sink = RecordingSink::default();
        let summary = process_items(Vec::new(), transform, sink.clone(), config(5, 100))
            .await
            .unwrap();
        assert_eq!(summary, ProcessSummary::default());
        assert_eq!(sink.events(), vec![StreamEvent::EndOfStream]);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_only_while_active() {
        let transform = |_: u8| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            TransformResult::Ok(Some("done".into()))
        };
        let sink = RecordingSink::default();
        let summary = process_items(vec![0, 1, 2], transform, sink.clone(), config(1, 100))
            .await
            .unwrap();

        // Three sequential one-second items with a 100ms period.
        assert!(
            (29..=30).contains(&summary.heartbeats),
            "unexpected heartbeat count {}",
            summary.heartbeats
        );
        assert_eq!(sink.count(&StreamEvent::Heartbeat), summary.heartbeats);

        let events = sink.events();
        assert_eq!(events.last(), Some(&StreamEvent::EndOfStream));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.events().len(), events.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn transform_failure_aborts_without_end_of_stream() {
        let transform = |n: u8| async move {
            if n == 1 {
                TransformResult::Err("cannot process".into())
            } else {
                tokio::time::sleep(Duration::from_millis(20)).await;
                TransformResult::Ok(Some(n.to_string()))
            }
        };
        let sink = RecordingSink::default();
        let err = process_items(vec![0, 1, 2, 3], transform, sink.clone(), config(2, 5))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            Error::Transform {
                position: 1,
                reason: "cannot process".into()
            }
        );
        assert_eq!(sink.count(&StreamEvent::EndOfStream), 0);

        // Detached siblings settle without writing anything further.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.count(&StreamEvent::EndOfStream), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let transform = |_: u8| async { TransformResult::Ok(None) };
        let err = process_items(vec![1], transform, RecordingSink::default(), config(0, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn keeps_processing_after_consumer_disconnects() {
        let processed = Arc::new(AtomicUsize::new(0));
        let transform = {
            let processed = Arc::clone(&processed);
            move |n: u8| {
                let processed = Arc::clone(&processed);
                async move {
                    processed.fetch_add(1, Ordering::SeqCst);
                    TransformResult::Ok(Some(n.to_string()))
                }
            }
        };
        let (sink, rx) = ChannelSink::channel(1);
        drop(rx);

        let summary = process_items(vec![0, 1, 2, 3], transform, sink, config(2, 100))
            .await
            .unwrap();
        assert_eq!(processed.load(Ordering::SeqCst), 4);
        assert_eq!(summary.discarded, 4);
        assert_eq!(summary.emitted, 0);
    }
}
