//! Reconnect handshake between the watchdog and the fetch task
//!
//! ```text
//! Streaming --request_reconnect--> AwaitingReconnect --begin_reconnect--> Reconnecting
//!     ^                                   ^                                  |     |
//!     |                                   +---------reconnect_failed---------+     |
//!     +----------resume----------- AwaitingResume <--------reconnected-------------+
//! ```
//!
//! Every transition is guarded on the current state, so a request raised
//! while one is already in flight is dropped instead of queued.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Streaming,
    AwaitingReconnect,
    Reconnecting,
    AwaitingResume,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Streaming => "streaming",
            Self::AwaitingReconnect => "awaiting_reconnect",
            Self::Reconnecting => "reconnecting",
            Self::AwaitingResume => "awaiting_resume",
        };
        f.write_str(s)
    }
}

/// Shared handle over the link state; clones observe the same machine
#[derive(Clone)]
pub struct LinkHandshake {
    tx: Arc<watch::Sender<LinkState>>,
}

impl Default for LinkHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkHandshake {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LinkState::Streaming);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> LinkState {
        *self.tx.borrow()
    }

    fn transition(&self, from: LinkState, to: LinkState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Raised by the watchdog. Returns false when a request is already pending.
    pub fn request_reconnect(&self) -> bool {
        self.transition(LinkState::Streaming, LinkState::AwaitingReconnect)
    }

    pub fn begin_reconnect(&self) -> bool {
        self.transition(LinkState::AwaitingReconnect, LinkState::Reconnecting)
    }

    pub fn reconnect_failed(&self) -> bool {
        self.transition(LinkState::Reconnecting, LinkState::AwaitingReconnect)
    }

    pub fn reconnected(&self) -> bool {
        self.transition(LinkState::Reconnecting, LinkState::AwaitingResume)
    }

    pub fn resume(&self) -> bool {
        self.transition(LinkState::AwaitingResume, LinkState::Streaming)
    }

    /// Resolve once the machine reaches `target`
    pub async fn wait_for(&self, target: LinkState) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|state| *state == target).await;
    }
}

/// Capped exponential backoff for reconnect attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
