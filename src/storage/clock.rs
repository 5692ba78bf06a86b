use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Source of creation timestamps (epoch milliseconds).
///
/// Readings are strictly increasing: two writes landing in the same
/// millisecond get consecutive values. A clock resumed from the latest stored
/// timestamp keeps that ordering across restarts.
#[derive(Debug, Default)]
pub struct StoreClock {
    last: AtomicI64,
}

impl StoreClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose next reading is strictly greater than `floor`.
    pub fn resume(floor: i64) -> Self {
        Self {
            last: AtomicI64::new(floor),
        }
    }

    pub fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_strictly_increase() {
        let clock = StoreClock::new();
        let mut prev = clock.now_millis();
        for _ in 0..10_000 {
            let next = clock.now_millis();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn resumed_clock_stays_ahead_of_floor() {
        let floor = Utc::now().timestamp_millis() + 60_000;
        let clock = StoreClock::resume(floor);
        assert_eq!(clock.now_millis(), floor + 1);
        assert_eq!(clock.now_millis(), floor + 2);
    }
}
