//! Command line interface

use clap::Parser;
use std::path::PathBuf;

use events_telemetry::LogLevel;

#[derive(Debug, Parser)]
#[command(name = "events", version, about = "gerrit events")]
pub struct Cli {
    /// Config file (.yml)
    #[arg(long = "config-file")]
    pub config_file: PathBuf,

    /// Listen port
    #[arg(long = "listen-port", default_value_t = 8080)]
    pub listen_port: u16,

    /// Log level (DEBUG|INFO|WARN|ERROR)
    #[arg(long = "log-level", default_value = "INFO", value_parser = parse_level)]
    pub log_level: LogLevel,
}

fn parse_level(s: &str) -> Result<LogLevel, String> {
    s.parse().map_err(|e: events_telemetry::TelemetryError| e.to_string())
}
