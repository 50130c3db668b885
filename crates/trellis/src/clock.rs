//! Time source for rate limiting.
//!
//! The ledger's burst window is measured against a [`Clock`] so tests can
//! drive time by hand with [`TestClock`] instead of sleeping.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

pub trait Clock {
    /// Milliseconds since an arbitrary, fixed origin.
    fn now_ms(&self) -> u64;
}

/// Monotonic wall clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Virtual time for deterministic tests.
///
/// Time only moves when [`TestClock::advance_by`] is called. Clones share
/// the same time.
#[derive(Debug, Clone, Default)]
pub struct TestClock {
    current_time_ms: Rc<Cell<u64>>,
}

impl TestClock {
    /// Create a new TestClock starting at time 0.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_by(&self, ms: u64) {
        self.current_time_ms.set(self.current_time_ms.get() + ms);
    }

    pub fn set(&self, ms: u64) {
        self.current_time_ms.set(ms);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.current_time_ms.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_only_moves_when_advanced() {
        let clock = TestClock::new();
        let shared = clock.clone();
        assert_eq!(clock.now_ms(), 0);
        shared.advance_by(150);
        assert_eq!(clock.now_ms(), 150);
        clock.set(10);
        assert_eq!(shared.now_ms(), 10);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now_ms();
        assert!(clock.now_ms() >= first);
    }
}
