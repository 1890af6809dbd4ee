//! Error types for event services

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EventsError>;

#[derive(Error, Debug)]
pub enum EventsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query error: {0}")]
    QueryParse(String),

    #[error("failed to init {component}: {source}")]
    Init {
        component: &'static str,
        #[source]
        source: Box<EventsError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EventsError {
    /// Wrap a startup failure with the name of the collaborator that raised it.
    pub fn init(component: &'static str, source: EventsError) -> Self {
        Self::Init {
            component,
            source: Box::new(source),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::QueryParse(_) => 404,
            Self::Connection(_) => 503,
            Self::Init { source, .. } => source.status_code(),
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::QueryParse(_) => "QUERY_PARSE_ERROR",
            Self::Init { .. } => "INIT_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for EventsError {
    fn from(err: std::io::Error) -> Self {
        EventsError::Connection(err.to_string())
    }
}

impl From<validator::ValidationErrors> for EventsError {
    fn from(err: validator::ValidationErrors) -> Self {
        EventsError::Config(err.to_string())
    }
}
