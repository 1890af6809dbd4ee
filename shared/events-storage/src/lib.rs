//! Events Storage
//!
//! Durable, time-range-queryable event store backed by SQLite.
//! Records are keyed by the event creation timestamp; ranges are
//! half-open (`since <= t < until`).

mod autoclean;
mod client;
mod error;
mod types;

pub use autoclean::Schedule;
pub use client::SqliteStorage;
pub use error::{Result, StorageError};
pub use types::*;

use async_trait::async_trait;
use events_core::Component;

/// Persistence sink contract consumed by the pipeline and the query surface
#[async_trait]
pub trait Storage: Component {
    /// Insert a batch of 1..=BATCH_SIZE records
    async fn create(&self, records: Vec<Record>) -> Result<()>;

    /// Records with `since <= eventCreatedOn < until`, oldest first
    async fn read(&self, since: i64, until: i64) -> Result<Vec<Record>>;

    /// Remove records in `since <= eventCreatedOn < until`; returns the count
    async fn delete(&self, since: i64, until: i64) -> Result<usize>;

    /// Replace the payload of the record(s) sharing `eventCreatedOn`
    async fn update(&self, record: Record) -> Result<usize>;
}
