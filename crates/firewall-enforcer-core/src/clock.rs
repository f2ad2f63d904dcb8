//! Clock abstraction.
//!
//! Batch ids and result timestamps are taken from an injected [`Clock`] so
//! tests can pin them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of the current time as microseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> u64;

    fn now_msec(&self) -> u64 {
        micros_to_msec(self.now_micros())
    }
}

pub fn micros_to_msec(micros: u64) -> u64 {
    micros / 1_000
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0)
    }
}

/// Clock frozen at a fixed timestamp.
#[derive(Debug, Clone, Copy)]
pub struct MockClock {
    micros: u64,
}

impl MockClock {
    pub fn new(micros: u64) -> Self {
        Self { micros }
    }
}

impl Clock for MockClock {
    fn now_micros(&self) -> u64 {
        self.micros
    }
}

/// Clock that moves forward by a fixed step on every read.
#[derive(Debug)]
pub struct AdvancingClock {
    micros: AtomicU64,
    step: u64,
}

impl AdvancingClock {
    pub fn new(start_micros: u64, step_micros: u64) -> Self {
        Self {
            micros: AtomicU64::new(start_micros),
            step: step_micros,
        }
    }
}

impl Clock for AdvancingClock {
    fn now_micros(&self) -> u64 {
        self.micros.fetch_add(self.step, Ordering::SeqCst)
    }
}
