//! # Telemetry
//!
//! Logging is always on: `tracing` events are printed through
//! `tracing_subscriber::fmt`, filtered by `RUST_LOG` (default `info`).
//!
//! OpenTelemetry export is optional:
//!
//! - `traces` exports the `stream` span of every processing run, with the
//!   events logged inside it.
//! - `metrics` exports the stream instruments below.
//! - `stdout` and `honeycomb` pick the exporters. Both may be enabled at once
//!   and each requires `traces` or `metrics`.
//!
//! | Instrument          | Kind           | Attributes         |
//! |---------------------|----------------|--------------------|
//! | `sessions_created`  | counter        |                    |
//! | `items_per_session` | histogram      |                    |
//! | `streams_inflight`  | up-down        |                    |
//! | `stream_duration`   | histogram (ms) | `outcome`, `items` |
//! | `stream_errors`     | counter        | `outcome`, `items` |
//! | `items_processed`   | counter        |                    |
//! | `heartbeats`        | counter        |                    |
//!
//! `items` is a size class rather than the raw count so the number of series
//! stays fixed.
//!
//! ```bash
//! cargo run -p sluice-server --features traces,metrics,stdout
//! HONEYCOMB_API_KEY=.. HONEYCOMB_DATASET=sluice HONEYCOMB_ENDPOINT=https://api.honeycomb.io:443 \
//!     cargo run -p sluice-server --features traces,honeycomb
//! ```

#[cfg(all(
    any(feature = "honeycomb", feature = "stdout"),
    not(any(feature = "traces", feature = "metrics"))
))]
compile_error!("The 'honeycomb' and 'stdout' exporters require 'traces' or 'metrics'.");

use core::fmt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, MeterProvider, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(feature = "traces")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "traces")]
use opentelemetry_sdk::trace as sdktrace;

#[cfg(feature = "honeycomb")]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(feature = "honeycomb")]
use tonic::{metadata::MetadataMap, transport::ClientTlsConfig};

#[cfg(any(feature = "metrics", feature = "traces"))]
const SERVICE_NAME: &str = "sluice";

/// How a stream, or a submission that never became one, ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `end-of-stream` was written.
    Complete,
    /// A transform failed and the run was aborted.
    Failed,
    /// The submission was refused before a session existed.
    Rejected,
}

impl Outcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Buckets an item count for use as a metric attribute.
#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
pub const fn size_class(items: usize) -> &'static str {
    match items {
        0 => "0",
        1..=10 => "1-10",
        11..=100 => "11-100",
        101..=1_000 => "101-1000",
        _ => "1000+",
    }
}

/// Attributes attached to the per-stream instruments.
#[cfg_attr(not(feature = "metrics"), allow(dead_code))]
fn stream_attributes(outcome: Outcome, items: usize) -> [(&'static str, &'static str); 2] {
    [("outcome", outcome.as_str()), ("items", size_class(items))]
}

/// Providers that must be flushed before the process exits.
pub struct TelemetryProviders {
    #[cfg(feature = "traces")]
    tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes pending spans and metrics and shuts the exporters down.
    pub fn shutdown(self) {
        #[cfg(feature = "traces")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

/// Installs the global subscriber and, depending on features, the span and
/// metric pipelines.
///
/// # Errors
///
/// Fails when an enabled exporter is misconfigured, e.g. a missing
/// `HONEYCOMB_*` variable.
pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(any(feature = "metrics", feature = "traces"))]
    let exporters = Exporters::from_env()?;
    #[cfg(any(feature = "metrics", feature = "traces"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "traces")]
    let tracer_provider = init_tracer(&exporters)?;
    #[cfg(feature = "traces")]
    let registry = registry.with(
        tracing_opentelemetry::layer()
            .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
            .with_error_records_to_exceptions(true),
    );

    #[cfg(feature = "metrics")]
    let meter_provider = {
        let provider = init_metrics(&exporters)?;
        let _ = METRICS.set(StreamMetrics::new(&provider.meter_with_scope(scope)));
        provider
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "traces")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "traces"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

/// Exporter settings read once from the environment and shared by the span
/// and metric pipelines.
#[cfg(any(feature = "metrics", feature = "traces"))]
struct Exporters {
    #[cfg(feature = "honeycomb")]
    honeycomb: Honeycomb,
}

#[cfg(any(feature = "metrics", feature = "traces"))]
impl Exporters {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            #[cfg(feature = "honeycomb")]
            honeycomb: Honeycomb::from_env()?,
        })
    }
}

/// OTLP/gRPC target for Honeycomb.
#[cfg(feature = "honeycomb")]
struct Honeycomb {
    endpoint: String,
    metadata: MetadataMap,
    compression: Compression,
}

#[cfg(feature = "honeycomb")]
impl Honeycomb {
    const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

    /// Reads `HONEYCOMB_API_KEY`, `HONEYCOMB_DATASET`, `HONEYCOMB_ENDPOINT`
    /// and `HONEYCOMB_COMPRESSION` (`gzip` when unset).
    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::str::FromStr;

        let var = |name: &str| std::env::var(name).with_context(|| format!("missing `{name}`"));

        let mut metadata = MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            var("HONEYCOMB_API_KEY")?
                .parse()
                .context("invalid `HONEYCOMB_API_KEY`")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            var("HONEYCOMB_DATASET")?
                .parse()
                .context("invalid `HONEYCOMB_DATASET`")?,
        );

        let compression = std::env::var("HONEYCOMB_COMPRESSION")
            .unwrap_or_else(|_| "gzip".into())
            .to_ascii_lowercase();

        Ok(Self {
            endpoint: var("HONEYCOMB_ENDPOINT")?,
            metadata,
            compression: Compression::from_str(&compression)
                .context("invalid `HONEYCOMB_COMPRESSION`")?,
        })
    }

    /// Applies the shared endpoint, TLS, auth and compression settings to an
    /// exporter builder.
    fn configure<B>(&self, builder: B) -> B
    where
        B: WithExportConfig + WithTonicConfig,
    {
        builder
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(self.metadata.clone())
            .with_compression(self.compression)
            .with_endpoint(self.endpoint.clone())
            .with_protocol(Protocol::Grpc)
            .with_timeout(Self::TIMEOUT)
    }
}

#[cfg(all(feature = "traces", any(feature = "stdout", feature = "honeycomb")))]
fn batch<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: sdktrace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "traces")]
#[cfg_attr(not(feature = "honeycomb"), allow(unused_variables))]
fn init_tracer(exporters: &Exporters) -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(batch(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;
        let exporter = exporters
            .honeycomb
            .configure(opentelemetry_otlp::SpanExporter::builder().with_tonic())
            .build()
            .context("failed to build span exporter")?;
        builder.with_span_processor(batch(exporter))
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
#[cfg_attr(not(feature = "honeycomb"), allow(unused_variables))]
fn init_metrics(exporters: &Exporters) -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(std::time::Duration::from_secs(5))
            .build(),
    );

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;
        let exporter = exporters
            .honeycomb
            .configure(
                opentelemetry_otlp::MetricExporter::builder()
                    .with_tonic()
                    .with_temporality(sdkmetrics::Temporality::Delta),
            )
            .build()
            .context("failed to build metric exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<StreamMetrics> = OnceLock::new();

#[cfg(feature = "metrics")]
struct StreamMetrics {
    sessions_created: Counter<u64>,
    items_per_session: Histogram<f64>,
    streams_inflight: UpDownCounter<i64>,
    stream_duration: Histogram<f64>,
    stream_errors: Counter<u64>,
    items_processed: Counter<u64>,
    heartbeats: Counter<u64>,
}

#[cfg(feature = "metrics")]
impl StreamMetrics {
    fn new(meter: &opentelemetry::metrics::Meter) -> Self {
        Self {
            sessions_created: meter
                .u64_counter("sessions_created")
                .with_description("Item lists submitted")
                .build(),
            items_per_session: meter
                .f64_histogram("items_per_session")
                .with_description("Items submitted per session")
                .build(),
            streams_inflight: meter
                .i64_up_down_counter("streams_inflight")
                .with_description("Open event streams")
                .build(),
            stream_duration: meter
                .f64_histogram("stream_duration")
                .with_unit("ms")
                .with_description("Time from stream open until the run settles")
                .build(),
            stream_errors: meter
                .u64_counter("stream_errors")
                .with_description("Rejected submissions and failed runs")
                .build(),
            items_processed: meter
                .u64_counter("items_processed")
                .with_description("Items settled by successful runs")
                .build(),
            heartbeats: meter
                .u64_counter("heartbeats")
                .with_description("Heartbeat comments written")
                .build(),
        }
    }
}

#[cfg(feature = "metrics")]
fn key_values(outcome: Outcome, items: usize) -> [KeyValue; 2] {
    stream_attributes(outcome, items).map(|(key, value)| KeyValue::new(key, value))
}

// Recording helpers compile to no-ops without `metrics`.

#[cfg(feature = "metrics")]
pub fn record_session_created(items: usize) {
    if let Some(m) = METRICS.get() {
        m.sessions_created.add(1, &[]);
        m.items_per_session.record(items as f64, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_session_created(_items: usize) {}

#[cfg(feature = "metrics")]
pub fn add_streams_inflight(delta: i64) {
    if let Some(m) = METRICS.get() {
        m.streams_inflight.add(delta, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn add_streams_inflight(_delta: i64) {}

/// Counts a rejected submission or a failed run.
#[cfg(feature = "metrics")]
pub fn record_stream_error(outcome: Outcome, items: usize) {
    if let Some(m) = METRICS.get() {
        m.stream_errors.add(1, &key_values(outcome, items));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_stream_error(_outcome: Outcome, _items: usize) {}

/// Records how long a run took to settle.
#[cfg(feature = "metrics")]
pub fn record_stream_duration(duration_ms: f64, outcome: Outcome, items: usize) {
    if let Some(m) = METRICS.get() {
        m.stream_duration
            .record(duration_ms, &key_values(outcome, items));
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_stream_duration(_duration_ms: f64, _outcome: Outcome, _items: usize) {}

#[cfg(feature = "metrics")]
pub fn record_run_totals(items: u64, heartbeats: u64) {
    if let Some(m) = METRICS.get() {
        m.items_processed.add(items, &[]);
        m.heartbeats.add(heartbeats, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_run_totals(_items: u64, _heartbeats: u64) {}
