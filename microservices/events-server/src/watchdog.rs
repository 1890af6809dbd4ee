//! Stream liveness watchdog
//!
//! The transport touches an [`ActivityClock`] whenever bytes arrive from
//! the peer.
//! The watchdog samples it on a fixed period and, once the stream has been
//! quiet for longer than the timeout, raises a reconnect request on the
//! [`LinkHandshake`]. It never touches the transport itself.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use validator::Validate;

use events_core::config::WatchdogSpec;
use events_core::{Component, Result};

use crate::reconnect::{LinkHandshake, LinkState};

/// Last-activity marker shared between the transport and the watchdog
#[derive(Clone)]
pub struct ActivityClock {
    origin: Instant,
    last_millis: Arc<AtomicU64>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last observed activity
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Snapshot taken on every sampling tick
#[derive(Debug, Clone, Copy)]
pub struct HealthRecord {
    pub idle: Duration,
    pub period: Duration,
    pub timeout: Duration,
}

impl HealthRecord {
    pub fn is_stalled(&self) -> bool {
        self.idle > self.timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPhase {
    Idle,
    Monitoring,
}

#[async_trait]
pub trait Watchdog: Component {
    /// Sample liveness until `cancel` fires, raising reconnect requests on `link`
    async fn run(&self, link: LinkHandshake, cancel: CancellationToken) -> Result<()>;
}

pub struct LivenessWatchdog {
    spec: WatchdogSpec,
    clock: ActivityClock,
    phase: Mutex<WatchdogPhase>,
}

impl LivenessWatchdog {
    pub fn new(spec: WatchdogSpec, clock: ActivityClock) -> Self {
        Self {
            spec,
            clock,
            phase: Mutex::new(WatchdogPhase::Idle),
        }
    }

    pub fn phase(&self) -> WatchdogPhase {
        *self.phase.lock()
    }

    pub fn health(&self) -> HealthRecord {
        HealthRecord {
            idle: self.clock.idle(),
            period: self.spec.period(),
            timeout: self.spec.timeout(),
        }
    }

    /// One sampling step. Returns true when a reconnect request was raised.
    pub fn tick(&self, link: &LinkHandshake) -> bool {
        let health = self.health();
        if !health.is_stalled() {
            return false;
        }

        if link.request_reconnect() {
            warn!(
                idle_secs = health.idle.as_secs(),
                timeout_secs = health.timeout.as_secs(),
                "Event stream stalled, requesting reconnect"
            );
            true
        } else {
            if link.state() != LinkState::Streaming {
                debug!(state = %link.state(), "Reconnect already in progress");
            }
            false
        }
    }
}

#[async_trait]
impl Component for LivenessWatchdog {
    fn name(&self) -> &'static str {
        "watchdog"
    }

    async fn init(&self) -> Result<()> {
        debug!("watchdog: init");
        self.spec.validate()?;
        Ok(())
    }

    async fn deinit(&self) -> Result<()> {
        debug!("watchdog: deinit");
        *self.phase.lock() = WatchdogPhase::Idle;
        Ok(())
    }
}

#[async_trait]
impl Watchdog for LivenessWatchdog {
    async fn run(&self, link: LinkHandshake, cancel: CancellationToken) -> Result<()> {
        let period = self.spec.period();
        info!(
            period_secs = period.as_secs(),
            timeout_secs = self.spec.timeout_seconds,
            "Watchdog monitoring"
        );
        *self.phase.lock() = WatchdogPhase::Monitoring;

        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(&link);
                }
            }
        }

        *self.phase.lock() = WatchdogPhase::Idle;
        debug!("Watchdog stopped");
        Ok(())
    }
}
