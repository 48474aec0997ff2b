//! Injected monotonic clock. The circuit breaker's recovery window and the
//! metrics recorder's windowed queries read time through this trait so
//! tests can advance it deterministically instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic time, injectable so tests can advance the clock
/// without real sleeps.
pub trait Clock: Send + Sync {
    /// Monotonic instant, used for durations and circuit-breaker windows.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch, used for persisted
    /// timestamps (audit entries, metric samples).
    fn now_ms(&self) -> i64;
}

/// Real wall-clock / monotonic clock used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A clock that can be advanced manually, for deterministic tests of the
/// circuit breaker's recovery window and the metrics recorder's windowed
/// queries without sleeping real time.
pub struct FakeClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        })
    }

    /// Advance the fake clock by `d`. Affects both `now()` and `now_ms()`.
    pub fn advance(&self, d: Duration) {
        self.offset_ms
            .fetch_add(d.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }

    fn now_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_clock_advances() {
        let clock = FakeClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(5));
        let t1 = clock.now();
        assert_eq!(t1.duration_since(t0), Duration::from_secs(5));
    }

    #[test]
    fn test_fake_clock_now_ms() {
        let clock = FakeClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now_ms(), 1500);
    }
}
