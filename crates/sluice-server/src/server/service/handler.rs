//! HTTP handlers for session submission and result streaming.
//!
//! This module defines [`StreamService`], the state shared by every route,
//! and the axum [`Router`] exposing it:
//!
//! | Method   | Path                   | Result                              |
//! |----------|------------------------|-------------------------------------|
//! | `POST`   | `/api/sessions`        | `{"sessionId": "..."}`              |
//! | `GET`    | `/api/stream?sessionId`| `text/event-stream`, or `404`       |
//! | `DELETE` | `/api/sessions/{id}`   | `204`, or `404`                     |
//! | `GET`    | `/health`              | `200 ok`, or `503` during shutdown  |
//!
//! ## Responsibilities
//!
//! - Validate submissions and store them in the [`SessionRegistry`].
//! - Consume a session when its stream opens and spawn the processing run.
//! - Close the response body once the run settles, optionally after an
//!   `error` event. Nothing follows a terminal event on the wire, even a
//!   result from a detached worker that was already waiting on the channel.
//! - Track in-flight streams so shutdown can wait for them.

use super::config::Item;
use crate::server::{
    config::ServerConfig,
    session::registry::SessionRegistry,
    streaming::{
        coordinator::process_items,
        sink::{ChannelSink, EventSink},
        transform::{Positioned, Transform},
    },
    telemetry::{
        Outcome, add_streams_inflight, record_run_totals, record_session_created,
        record_stream_duration, record_stream_error,
    },
};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use core::{convert::Infallible, time::Duration};
use futures::{Stream, StreamExt, future};
use portable_atomic::{AtomicUsize, Ordering};
use sluice_core::{
    Error,
    event::StreamEvent,
    types::{
        EVENT_STREAM_CONTENT_TYPE, HEALTH_PATH, SESSIONS_PATH, STREAM_PATH, SessionId,
        StreamQuery, SubmitRequest, SubmitResponse,
    },
};
use std::{sync::Arc, time::Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::Instrument;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Streaming service shared by all HTTP handlers.
///
/// Cloning is cheap: every field is reference counted. `X` is the per-item
/// transform applied to every submitted item.
pub struct StreamService<X> {
    config: Arc<ServerConfig>,
    registry: SessionRegistry,
    transform: Arc<X>,
    shutdown: CancellationToken,
    streams_inflight: Arc<AtomicUsize>,
}

impl<X> Clone for StreamService<X> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            registry: self.registry.clone(),
            transform: Arc::clone(&self.transform),
            shutdown: self.shutdown.clone(),
            streams_inflight: Arc::clone(&self.streams_inflight),
        }
    }
}

impl<X: Transform<Item>> StreamService<X> {
    /// Creates the service and, when a session TTL is configured, starts the
    /// session sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig, transform: X) -> Self {
        let registry = SessionRegistry::new();
        let shutdown = CancellationToken::new();

        if let (Some(ttl), Some(period)) = (config.session_ttl, config.sweep_period()) {
            registry.spawn_sweeper(ttl, period, shutdown.child_token());
        }

        Self {
            config: Arc::new(config),
            registry,
            transform: Arc::new(transform),
            shutdown,
            streams_inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn streams_inflight(&self) -> usize {
        self.streams_inflight.load(Ordering::Acquire)
    }

    /// Builds the axum router serving this service.
    pub fn router(&self) -> Router {
        Router::new()
            .route(SESSIONS_PATH, post(submit::<X>))
            .route(&format!("{SESSIONS_PATH}/{{id}}"), delete(cancel::<X>))
            .route(STREAM_PATH, get(stream::<X>))
            .route(HEALTH_PATH, get(health::<X>))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Begins a graceful shutdown.
    ///
    /// Health turns to `503`, new submissions and streams are refused and
    /// the session sweeper stops. Open streams are given up to the
    /// configured shutdown timeout to finish. Returns how many were still
    /// running when the wait ended.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let remaining = self.streams_inflight();
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                return remaining;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }

    fn ensure_serving(&self) -> Result<(), Error> {
        if self.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }
        Ok(())
    }

    fn create_session(&self, items: Vec<serde_json::Value>) -> Result<SessionId, Error> {
        self.ensure_serving()?;

        if items.len() > self.config.max_items {
            record_stream_error(Outcome::Rejected, items.len());
            return Err(Error::InvalidRequest {
                reason: format!(
                    "Item count {} exceeds maximum allowed ({})",
                    items.len(),
                    self.config.max_items
                ),
            });
        }

        let count = items.len();
        let id = self.registry.create(items);
        record_session_created(count);
        tracing::info!(session_id = %id, items = count, "Session created");
        Ok(id)
    }

    /// Consumes the session and spawns its processing run. Returns the
    /// receiving end of the run's event channel.
    fn open_stream(
        &self,
        session_id: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamEvent>, Error> {
        self.ensure_serving()?;

        let items = self.registry.take(session_id)?;
        let count = items.len();
        let (sink, rx) = ChannelSink::channel(self.config.stream_buffer_size);
        let guard = InflightGuard::new(Arc::clone(&self.streams_inflight));

        let transform = Arc::clone(&self.transform);
        let apply = move |item: Item| {
            let transform = Arc::clone(&transform);
            async move { transform.apply(item).await }
        };
        let processor = self.config.processor;
        let emit_error_events = self.config.emit_error_events;

        let fut = async move {
            let start = Instant::now();
            let outcome = match process_items(
                Positioned::enumerate(items),
                apply,
                sink.clone(),
                processor,
            )
            .await
            {
                Ok(summary) => {
                    record_run_totals(summary.items as u64, summary.heartbeats as u64);
                    tracing::info!(
                        outcome = %Outcome::Complete,
                        items = summary.items,
                        emitted = summary.emitted,
                        skipped = summary.skipped,
                        discarded = summary.discarded,
                        "Stream complete"
                    );
                    Outcome::Complete
                }
                Err(e) => {
                    record_stream_error(Outcome::Failed, count);
                    tracing::warn!(outcome = %Outcome::Failed, items = count, "Stream failed: {e}");
                    if emit_error_events {
                        sink.send(StreamEvent::Error(e.to_string())).await;
                    }
                    Outcome::Failed
                }
            };
            record_stream_duration(start.elapsed().as_secs_f64() * 1_000.0, outcome, count);
            sink.close();
            drop(guard);
        };
        let span = tracing::info_span!("stream", session_id = %session_id);
        tokio::spawn(fut.instrument(span));

        Ok(rx)
    }
}

/// Counts one open stream for as long as it lives.
struct InflightGuard {
    counter: Arc<AtomicUsize>,
}

impl InflightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        add_streams_inflight(1);
        Self { counter }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
        add_streams_inflight(-1);
    }
}

async fn submit<X: Transform<Item>>(
    State(service): State<StreamService<X>>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, Error> {
    let session_id = service.create_session(request.items)?;
    Ok(Json(SubmitResponse { session_id }))
}

async fn stream<X: Transform<Item>>(
    State(service): State<StreamService<X>>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, Error> {
    let rx = service.open_stream(&query.session_id)?;

    let body = Body::from_stream(
        until_terminal(ReceiverStream::new(rx)).map(|event| Ok::<_, Infallible>(event.encode())),
    );

    Ok((
        [
            (header::CONTENT_TYPE, EVENT_STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response())
}

/// Passes events through up to and including the first terminal one, then
/// ends. Dropping the receiver afterwards closes the sink for stragglers.
fn until_terminal<S>(events: S) -> impl Stream<Item = StreamEvent>
where
    S: Stream<Item = StreamEvent>,
{
    events.scan(false, |ended, event| {
        if *ended {
            return future::ready(None);
        }
        *ended = event.is_terminal();
        future::ready(Some(event))
    })
}

async fn cancel<X: Transform<Item>>(
    State(service): State<StreamService<X>>,
    Path(session_id): Path<SessionId>,
) -> Result<StatusCode, Error> {
    if service.registry.release(&session_id) {
        tracing::info!(session_id = %session_id, "Session cancelled");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::SessionNotFound { id: session_id })
    }
}

async fn health<X: Transform<Item>>(State(service): State<StreamService<X>>) -> Response {
    if service.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response()
    } else {
        (StatusCode::OK, "ok").into_response()
    }
}
