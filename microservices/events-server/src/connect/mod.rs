//! Outward connections: the remote event stream and the query surface

pub mod http;
pub mod ssh;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use events_core::{Component, ConnectionState, Result};

pub use http::{AppState, HttpSurface};
pub use ssh::SshTransport;

/// Remote command whose stdout is the newline-delimited event stream
pub const STREAM_COMMAND: &str = "stream-events";

/// Authenticated remote session able to run one long-lived command
#[async_trait]
pub trait Transport: Component {
    /// Run `command` and deliver each output line to `sink`.
    ///
    /// Returns when the remote output ends, the session fails, or `cancel`
    /// fires. Never retries on its own.
    async fn start(
        &self,
        command: &str,
        sink: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Tear down the current session and authenticate a fresh one
    async fn reconnect(&self) -> Result<()>;

    fn state(&self) -> ConnectionState;
}

/// Connection state published by the transport, readable by the query surface
#[derive(Clone, Default)]
pub struct ConnectionStatus(Arc<RwLock<ConnectionState>>);

impl ConnectionStatus {
    pub fn get(&self) -> ConnectionState {
        *self.0.read()
    }

    pub fn set(&self, state: ConnectionState) {
        *self.0.write() = state;
    }
}
