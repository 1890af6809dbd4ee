//! Storage Types

use serde::{Deserialize, Serialize};

/// Upper bound on records accepted by a single `create` call
pub const BATCH_SIZE: usize = 100;

/// Name of the indexed key column
pub const PRIMARY_KEY: &str = "event_created_on";

/// A persisted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Raw stream line, base64 encoded
    pub event_base64: String,
    /// Event creation time, seconds since epoch
    pub event_created_on: i64,
}

/// Store configuration
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// SQLite database path; `:memory:` keeps everything in process
    pub filename: String,
    /// Cleanup schedule; empty disables it
    pub autoclean: String,
}

impl StoreConfig {
    pub fn from_spec(spec: &events_core::config::StorageSpec) -> Self {
        Self {
            filename: spec.sqlite.filename.clone(),
            autoclean: spec.autoclean.clone(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            filename: ":memory:".to_string(),
            autoclean: String::new(),
        }
    }
}
