pub mod config;
pub mod pool;
pub mod service;
pub mod session;
pub mod streaming;
pub mod telemetry;
