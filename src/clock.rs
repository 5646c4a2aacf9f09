//! Monotonic time source.
//!
//! The engine never calls `Instant::now()` directly: every timestamp
//! flows through a `Clock`, so tests can drive the `ringing -> established`
//! delay (and the liveness reaper) without a real 2-second sleep. This
//! replaces the teacher crate's wall-clock `SystemTime` reads with an
//! injectable source, per the "coroutine sleep -> explicit timer queue
//! + injected clock" design note.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// A monotonic instant expressed in milliseconds since some fixed
/// epoch. Only differences between two `MonoTime` values are
/// meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MonoTime(pub u64);

impl MonoTime {
    pub const ZERO: MonoTime = MonoTime(0);

    pub fn saturating_sub(self, other: MonoTime) -> u64 {
        self.0.saturating_sub(other.0)
    }

    pub fn add_millis(self, millis: u64) -> MonoTime {
        MonoTime(self.0.saturating_add(millis))
    }
}

/// Source of monotonic time for everything in the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> MonoTime;
}

/// Production clock: wraps `std::time::Instant`.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonoTime {
        MonoTime(self.epoch.elapsed().as_millis() as u64)
    }
}

/// Test clock: starts at zero and only advances when told to.
///
/// Cloning a `FakeClock` shares the same underlying counter (it hands
/// out `Arc`-like handles via an `AtomicU64`), so a test can hold one
/// handle to advance time and hand another to the engine.
#[derive(Clone)]
pub struct FakeClock {
    millis: std::sync::Arc<AtomicU64>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self { millis: std::sync::Arc::new(AtomicU64::new(0)) }
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> MonoTime {
        MonoTime(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_only_advances_when_told() {
        let clock = FakeClock::new();
        assert_eq!(clock.now(), MonoTime::ZERO);
        clock.advance(2000);
        assert_eq!(clock.now(), MonoTime(2000));
        clock.advance(31_000);
        assert_eq!(clock.now(), MonoTime(33_000));
    }
}
