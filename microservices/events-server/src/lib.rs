//! Events Server
//!
//! Ingests the review-system event stream over SSH, buffers it, persists
//! it to SQLite and serves time-range queries over HTTP.
//!
//! - `connect` - SSH transport and HTTP query surface
//! - `watchdog` - stream liveness detection
//! - `reconnect` - reconnect handshake and backoff
//! - `queue` - bounded FIFO between ingestion and persistence
//! - `pipeline` - orchestrator lifecycle and task wiring

pub mod cli;
pub mod connect;
pub mod events;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod reconnect;
pub mod watchdog;

pub use connect::{ConnectionStatus, Transport, STREAM_COMMAND};
pub use pipeline::{Collaborators, Orchestrator, PipelineMetrics, PipelineSettings};
pub use queue::{MemoryQueue, Queue};
pub use reconnect::{Backoff, LinkHandshake, LinkState};
pub use watchdog::{ActivityClock, LivenessWatchdog, Watchdog};
