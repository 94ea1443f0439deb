use crate::server::streaming::coordinator::ProcessorConfig;
use anyhow::bail;
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `sluice-server` binary.
///
/// These settings control the concurrency, heartbeat cadence, buffering and
/// session lifecycle of the streaming service. All values are parsed from CLI
/// arguments or environment variables, with defaults suitable for a single
/// instance behind a reverse proxy.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "sluice-server",
    version,
    about = "An HTTP service streaming progressively computed results as Server-Sent Events"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:3000"))]
    pub server_addr: String,

    /// Maximum number of item transforms in flight per stream.
    ///
    /// Environment variable: `CONCURRENCY`
    #[arg(long, env = "CONCURRENCY", default_value_t = 5)]
    pub concurrency: usize,

    /// Period, in milliseconds, between heartbeat comments on an active
    /// stream.
    ///
    /// Keep this below the idle timeout of every proxy between the server and
    /// its clients.
    ///
    /// Environment variable: `HEARTBEAT_INTERVAL_MS`
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 100)]
    pub heartbeat_interval_ms: u64,

    /// Capacity of the event buffer between the processor and the response
    /// body.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 32)]
    pub stream_buffer_size: usize,

    /// Maximum number of items accepted in a single submission.
    ///
    /// Environment variable: `MAX_ITEMS`
    #[arg(long, env = "MAX_ITEMS", default_value_t = 10_000)]
    pub max_items: usize,

    /// Seconds after which an unstreamed session is evicted. `0` keeps
    /// sessions until they are streamed or cancelled.
    ///
    /// Environment variable: `SESSION_TTL_SECS`
    #[arg(long, env = "SESSION_TTL_SECS", default_value_t = 0)]
    pub session_ttl_secs: u64,

    /// Write an `error` event before closing a stream whose run failed.
    /// Without it a failed stream simply ends.
    ///
    /// Environment variable: `EMIT_ERROR_EVENTS`
    #[arg(long, env = "EMIT_ERROR_EVENTS", default_value_t = false)]
    pub emit_error_events: bool,

    /// Artificial per-item delay, in milliseconds, applied by the echo
    /// transform.
    ///
    /// Environment variable: `SIMULATED_LATENCY_MS`
    #[arg(long, env = "SIMULATED_LATENCY_MS", default_value_t = 0)]
    pub simulated_latency_ms: u64,

    /// Seconds to wait for in-flight streams to finish on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub processor: ProcessorConfig,
    pub stream_buffer_size: usize,
    pub max_items: usize,
    pub session_ttl: Option<Duration>,
    pub emit_error_events: bool,
    pub simulated_latency: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: String::from("0.0.0.0:3000"),
            processor: ProcessorConfig::default(),
            stream_buffer_size: 32,
            max_items: 10_000,
            session_ttl: None,
            emit_error_events: false,
            simulated_latency: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl ServerConfig {
    /// How often the session sweeper runs for the configured TTL.
    pub fn sweep_period(&self) -> Option<Duration> {
        self.session_ttl
            .map(|ttl| (ttl / 2).max(Duration::from_secs(1)))
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.concurrency == 0 {
            bail!("CONCURRENCY must be greater than 0");
        }

        if args.heartbeat_interval_ms == 0 {
            bail!("HEARTBEAT_INTERVAL_MS must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        if args.max_items == 0 {
            bail!("MAX_ITEMS must be greater than 0");
        }

        Ok(Self {
            server_addr: args.server_addr,
            processor: ProcessorConfig {
                concurrency: args.concurrency,
                heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            },
            stream_buffer_size: args.stream_buffer_size,
            max_items: args.max_items,
            session_ttl: (args.session_ttl_secs > 0)
                .then(|| Duration::from_secs(args.session_ttl_secs)),
            emit_error_events: args.emit_error_events,
            simulated_latency: Duration::from_millis(args.simulated_latency_ms),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}
