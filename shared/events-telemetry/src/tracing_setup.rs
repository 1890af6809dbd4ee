//! Global subscriber installation

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{TelemetryConfig, TelemetryError};

fn build_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(&directives)
            .map_err(|e| TelemetryError::InvalidLevel(format!("{}: {}", directives, e))),
        _ => Ok(EnvFilter::new(config.log_level.as_directive())),
    }
}

/// Install the process-wide subscriber.
///
/// `RUST_LOG`, when set, replaces the CLI level. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(config)?;

    let output = if config.json_logs {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .map_err(|e| TelemetryError::TracingInit(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        level = %config.log_level,
        json = config.json_logs,
        "Logging ready"
    );
    Ok(())
}
