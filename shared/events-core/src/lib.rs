//! Events Core - Shared domain types and service infrastructure
//!
//! This crate provides:
//! - The lifecycle contract every pipeline collaborator implements
//! - Common domain types (Event, ConnectionState, LifecycleState)
//! - Error taxonomy shared by all crates
//! - Configuration file model and loader

pub mod config;
pub mod domain;
pub mod error;
pub mod service;

pub use config::Config;
pub use domain::*;
pub use error::{EventsError, Result};
pub use service::{wait_for_shutdown, Component, HealthStatus};
