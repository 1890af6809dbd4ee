//! Common domain types used across event services

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EventsError, Result};

/// One change-management event as it arrives on the stream.
///
/// Only the creation timestamp is interpreted; everything else is carried
/// through untouched. Events without a timestamp are keyed at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "eventCreatedOn", default)]
    pub event_created_on: i64,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Decode one raw stream line
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line)
            .map_err(|e| EventsError::Internal(format!("failed to decode event: {}", e)))
    }

    /// Event type tag, when the producer sets one
    pub fn kind(&self) -> Option<&str> {
        self.payload.get("type").and_then(|v| v.as_str())
    }
}

/// State of the remote transport session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Streaming,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Streaming => write!(f, "streaming"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Pipeline lifecycle owned by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}
