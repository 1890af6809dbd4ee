//! In-process pipeline metrics
//!
//! Handles are cheap to clone and every clone updates the same value, so a
//! task can own its copy while the stats endpoint reads another.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
struct Slot {
    name: &'static str,
    value: Arc<AtomicU64>,
}

impl Slot {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            value: Arc::new(AtomicU64::new(0)),
        }
    }

    fn load(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Monotonic count of things that happened
#[derive(Clone)]
pub struct Counter(Slot);

impl Counter {
    pub fn new(name: &'static str) -> Self {
        Self(Slot::new(name))
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load()
    }

    pub fn name(&self) -> &'static str {
        self.0.name
    }
}

/// Last observed level of something that rises and falls
#[derive(Clone)]
pub struct Gauge(Slot);

impl Gauge {
    pub fn new(name: &'static str) -> Self {
        Self(Slot::new(name))
    }

    pub fn set(&self, val: u64) {
        self.0.value.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load()
    }

    pub fn name(&self) -> &'static str {
        self.0.name
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name(), self.get())
    }
}

impl fmt::Display for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name(), self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let received = Counter::new("events_received");
        received.inc();
        received.add(4);
        assert_eq!(received.get(), 5);
        assert_eq!(received.to_string(), "events_received=5");
    }

    #[test]
    fn test_clones_share_state() {
        let persisted = Counter::new("events_persisted");
        let handle = persisted.clone();
        handle.inc();
        assert_eq!(persisted.get(), 1);

        let depth = Gauge::new("queue_depth");
        depth.clone().set(7);
        assert_eq!(depth.get(), 7);
    }

    #[test]
    fn test_gauge_overwrites() {
        let depth = Gauge::new("queue_depth");
        depth.set(10);
        depth.set(3);
        assert_eq!(depth.get(), 3);
        assert_eq!(depth.name(), "queue_depth");
    }
}
