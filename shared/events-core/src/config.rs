//! Configuration file model for the events service
//!
//! The file is a Kubernetes-style manifest:
//!
//! ```yaml
//! apiVersion: v1
//! kind: events
//! metadata:
//!   name: events
//! spec:
//!   connect:
//!     hostname: review.example.com
//!     ssh:
//!       keyfile: /home/bot/.ssh/id_rsa
//!       keyfilePassword: ""
//!       port: 29418
//!       username: bot
//!   storage:
//!     autoclean: "0 0 * * *"
//!     sqlite:
//!       filename: /var/lib/events/events.db
//!   watchdog:
//!     periodSeconds: 20
//!     timeoutSeconds: 60
//! ```

use crate::error::{EventsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

pub const DEFAULT_SSH_PORT: u16 = 29418;
pub const DEFAULT_WATCHDOG_PERIOD_SECS: u64 = 20;
pub const DEFAULT_WATCHDOG_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: Spec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Spec {
    #[serde(default)]
    pub connect: ConnectSpec,
    #[serde(default)]
    pub queue: QueueSpec,
    #[serde(default)]
    pub storage: StorageSpec,
    #[serde(default)]
    pub watchdog: WatchdogSpec,
}

/// Remote host the event stream is read from
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ConnectSpec {
    #[serde(default)]
    #[validate(length(min = 1, message = "connect.hostname is required"))]
    pub hostname: String,
    #[serde(default)]
    #[validate(nested)]
    pub ssh: SshSpec,
}

#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct SshSpec {
    #[serde(default)]
    #[validate(length(min = 1, message = "connect.ssh.keyfile is required"))]
    pub keyfile: String,
    #[serde(rename = "keyfilePassword", default)]
    pub keyfile_password: String,
    #[serde(default = "default_ssh_port")]
    #[validate(range(min = 1, message = "connect.ssh.port must be positive"))]
    pub port: u16,
    #[serde(default)]
    #[validate(length(min = 1, message = "connect.ssh.username is required"))]
    pub username: String,
}

impl Default for SshSpec {
    fn default() -> Self {
        Self {
            keyfile: String::new(),
            keyfile_password: String::new(),
            port: DEFAULT_SSH_PORT,
            username: String::new(),
        }
    }
}

// Keeps the key passphrase out of logs.
impl std::fmt::Debug for SshSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSpec")
            .field("keyfile", &self.keyfile)
            .field("keyfile_password", &"<redacted>")
            .field("port", &self.port)
            .field("username", &self.username)
            .finish()
    }
}

impl SshSpec {
    pub fn passphrase(&self) -> Option<&str> {
        if self.keyfile_password.is_empty() {
            None
        } else {
            Some(self.keyfile_password.as_str())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSpec {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSpec {
    /// Cron expression or `@every <duration>`; empty disables cleanup
    #[serde(default)]
    pub autoclean: String,
    #[serde(default)]
    pub sqlite: SqliteSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqliteSpec {
    #[serde(default)]
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WatchdogSpec {
    #[serde(rename = "periodSeconds", default = "default_period")]
    #[validate(range(min = 1, message = "watchdog.periodSeconds must be positive"))]
    pub period_seconds: u64,
    #[serde(rename = "timeoutSeconds", default = "default_timeout")]
    #[validate(range(min = 1, message = "watchdog.timeoutSeconds must be positive"))]
    pub timeout_seconds: u64,
}

impl Default for WatchdogSpec {
    fn default() -> Self {
        Self {
            period_seconds: DEFAULT_WATCHDOG_PERIOD_SECS,
            timeout_seconds: DEFAULT_WATCHDOG_TIMEOUT_SECS,
        }
    }
}

impl WatchdogSpec {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_period() -> u64 {
    DEFAULT_WATCHDOG_PERIOD_SECS
}

fn default_timeout() -> u64 {
    DEFAULT_WATCHDOG_TIMEOUT_SECS
}

impl Config {
    /// Load a config file from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let buf = std::fs::read_to_string(path).map_err(|e| {
            EventsError::Config(format!("failed to open {}: {}", path.display(), e))
        })?;

        Self::from_yaml(&buf)
    }

    pub fn from_yaml(buf: &str) -> Result<Self> {
        serde_yaml::from_str(buf)
            .map_err(|e| EventsError::Config(format!("failed to unmarshal: {}", e)))
    }
}
