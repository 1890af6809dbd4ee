//! Events daemon
//!
//! Streams review events over SSH into SQLite and serves them back over
//! `GET /events/?q=since:<ts> until:<ts>`.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use events_core::{wait_for_shutdown, Config};
use events_server::cli::Cli;
use events_server::connect::http::SERVICE_NAME;
use events_server::Orchestrator;
use events_telemetry::{init_tracing, TelemetryConfig};

const RUN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        println!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    init_tracing(&TelemetryConfig::new(SERVICE_NAME, cli.log_level))
        .context("failed to init logger")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config_file.display(),
        port = cli.listen_port,
        "Starting events service"
    );

    let config = Config::from_file(&cli.config_file).context("failed to init config")?;

    let pipeline = Arc::new(Orchestrator::from_config(&config, cli.listen_port));
    pipeline.init().await.context("failed to init pipeline")?;

    let runner = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            // A failed pipeline leaves the process up; the query API keeps serving.
            if let Err(e) = pipeline.run().await {
                error!(error = %e, "Pipeline is degraded");
            }
        })
    };

    wait_for_shutdown().await;
    info!("Shutting down");

    if let Err(e) = pipeline.deinit().await {
        error!(error = %e, "Shutdown failed");
    }
    if tokio::time::timeout(RUN_DRAIN_TIMEOUT, runner).await.is_err() {
        error!("Pipeline tasks did not stop in time");
    }

    info!("Events service stopped");
    Ok(())
}
