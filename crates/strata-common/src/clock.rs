//! Clock abstraction
//!
//! Entity timestamps, retry windows and condition evaluation all read the
//! current time through [`Clock`], so tests can drive time explicitly with
//! [`MockClock`] while production code uses [`SystemClock`].

use crate::types::UtcTime;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Source of the current time
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> UtcTime;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UtcTime {
        UtcTime::from_datetime(Utc::now())
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<UtcTime>,
}

impl MockClock {
    #[must_use]
    pub const fn new(start: UtcTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Set the current time
    pub fn set(&self, now: UtcTime) {
        *self.now.lock() = now;
    }

    /// Move the current time forward
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now = now.add(duration);
    }
}

impl Clock for MockClock {
    fn now(&self) -> UtcTime {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::new(UtcTime::parse("2000-01-01T00:00:00.000Z").unwrap());
        clock.advance(Duration::from_secs(61));
        assert_eq!(clock.now().to_string(), "2000-01-01T00:01:01.000Z");
    }
}
