//! Service infrastructure shared by every pipeline collaborator

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info};

use crate::error::Result;

/// Health status for liveness probes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub service_id: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Lifecycle contract of a pipeline collaborator.
///
/// The orchestrator initializes collaborators in a fixed order and tears
/// them down in reverse. `deinit` must be idempotent and safe to call on a
/// component that never initialized.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Short name used when wrapping startup errors (e.g. "ssh", "storage")
    fn name(&self) -> &'static str;

    async fn init(&self) -> Result<()>;

    async fn deinit(&self) -> Result<()>;
}

/// Resolve once SIGINT or SIGTERM is delivered
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
