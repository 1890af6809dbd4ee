//! Storage Error Types

use events_core::EventsError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid range: since={since} until={until}")]
    InvalidRange { since: i64, until: i64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage is not initialized")]
    Uninitialized,

    #[error("Background task failed: {0}")]
    Join(String),
}

impl From<StorageError> for EventsError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Configuration(msg) => EventsError::Config(msg),
            other => EventsError::Storage(other.to_string()),
        }
    }
}
