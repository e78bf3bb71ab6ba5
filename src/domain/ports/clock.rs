//! Time source port.
//!
//! All timestamping and expiry decisions go through this trait so tests
//! can drive the clock deterministically.

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Monotonic + wall time source.
pub trait Clock: Send + Sync {
    /// Wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Milliseconds elapsed since the clock was created; monotonic.
    fn monotonic_ms(&self) -> u64;
}

/// Production clock backed by the system.
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
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock for deterministic tests.
pub struct ManualClock {
    state: Mutex<ManualState>,
}

struct ManualState {
    now: DateTime<Utc>,
    monotonic_ms: u64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                monotonic_ms: 0,
            }),
        }
    }

    /// Advance both wall and monotonic time.
    pub fn advance_ms(&self, ms: u64) {
        let mut state = self.state.lock().expect("manual clock poisoned");
        state.now += ChronoDuration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX));
        state.monotonic_ms += ms;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().expect("manual clock poisoned").now
    }

    fn monotonic_ms(&self) -> u64 {
        self.state.lock().expect("manual clock poisoned").monotonic_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.monotonic_ms();
        let b = clock.monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.monotonic_ms(), 0);

        clock.advance_ms(1_500);
        assert_eq!(clock.now(), start + ChronoDuration::milliseconds(1_500));
        assert_eq!(clock.monotonic_ms(), 1_500);
    }
}
