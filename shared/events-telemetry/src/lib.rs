//! Events Telemetry
//!
//! Process logging setup and lightweight in-process metrics.

mod config;
mod metrics;
mod tracing_setup;

pub use config::{LogLevel, TelemetryConfig};
pub use metrics::{Counter, Gauge};
pub use tracing_setup::init_tracing;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),

    #[error("Invalid log level: {0}")]
    InvalidLevel(String),
}
