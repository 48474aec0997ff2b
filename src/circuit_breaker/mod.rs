//! Circuit Breaker: per-backend CLOSED/OPEN/HALF_OPEN state machine with a
//! persisted row per backend and a mutex-protected compound "read state ->
//! maybe transition -> answer" critical section.
//!
//! A single breaker type with pluggable persistence, keyed internally by
//! backend id (see DESIGN.md for the Open Question resolution). The
//! HALF_OPEN exclusivity invariant is enforced by an explicit
//! `probe_in_flight` flag so only one caller observes the probe window.

pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::model::BackendId;
pub use store::{BreakerStore, InMemoryBreakerStore};

/// Default consecutive-failure threshold before tripping to OPEN.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
/// Default reset window before OPEN allows a HALF_OPEN probe.
pub const DEFAULT_RESET_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Persisted snapshot of a backend's breaker state. Timestamps are
/// wall-clock milliseconds since the epoch (via [`Clock::now_ms`]) so they
/// survive a process restart; in-memory transitions use [`Instant`] for
/// monotonic comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerRow {
    pub backend_name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure_time_ms: Option<i64>,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_failure_ms: Option<i64>,
    probe_in_flight: bool,
}

impl Inner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            last_failure_ms: None,
            probe_in_flight: false,
        }
    }

    fn to_row(&self, backend: &BackendId) -> BreakerRow {
        BreakerRow {
            backend_name: backend.as_str().to_string(),
            state: self.state,
            failures: self.consecutive_failures,
            last_failure_time_ms: self.last_failure_ms,
        }
    }
}

/// Per-backend circuit breaker with injected persistence and clock.
pub struct CircuitBreaker {
    backends: Mutex<HashMap<BackendId, Inner>>,
    store: Arc<dyn BreakerStore>,
    clock: Arc<dyn Clock>,
    failure_threshold: u32,
    reset_window: Duration,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn BreakerStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backends: Mutex::new(HashMap::new()),
            store,
            clock,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_window: DEFAULT_RESET_WINDOW,
        }
    }

    pub fn with_thresholds(mut self, failure_threshold: u32, reset_window: Duration) -> Self {
        self.failure_threshold = failure_threshold;
        self.reset_window = reset_window;
        self
    }

    /// Restore a backend's last-persisted row into the in-memory map. A
    /// backend absent from the store is assumed CLOSED with zero failures.
    pub async fn hydrate(&self, backend: &BackendId) {
        let row = self.store.get(backend).await;
        let mut guard = self.backends.lock().expect("breaker mutex poisoned");
        let inner = match row {
            Some(row) => Inner {
                state: row.state,
                consecutive_failures: row.failures,
                last_failure_at: None,
                last_failure_ms: row.last_failure_time_ms,
                probe_in_flight: false,
            },
            None => Inner::closed(),
        };
        guard.insert(backend.clone(), inner);
    }

    /// The sole admission gate. Performs the OPEN -> HALF_OPEN transition
    /// and its exclusivity check inside one critical section so concurrent
    /// callers at the moment of window expiry never both observe
    /// "available".
    pub async fn is_available(&self, backend: &BackendId) -> bool {
        let (available, row) = {
            let mut guard = self.backends.lock().expect("breaker mutex poisoned");
            let inner = guard.entry(backend.clone()).or_insert_with(Inner::closed);

            match inner.state {
                CircuitState::Closed => (true, None),
                CircuitState::HalfOpen => (!inner.probe_in_flight, None),
                CircuitState::Open => {
                    let elapsed = inner
                        .last_failure_at
                        .map(|t| self.clock.now().duration_since(t))
                        .unwrap_or(Duration::MAX);
                    if elapsed >= self.reset_window {
                        inner.state = CircuitState::HalfOpen;
                        inner.probe_in_flight = true;
                        (true, Some(inner.to_row(backend)))
                    } else {
                        (false, None)
                    }
                }
            }
        };

        if let Some(row) = row {
            self.store.put(row).await;
        }
        available
    }

    /// `onSuccess` (the Closed/HalfOpen/Open transition table).
    pub async fn on_success(&self, backend: &BackendId) {
        let row = {
            let mut guard = self.backends.lock().expect("breaker mutex poisoned");
            let inner = guard.entry(backend.clone()).or_insert_with(Inner::closed);
            inner.probe_in_flight = false;
            if inner.state != CircuitState::Closed || inner.consecutive_failures != 0 {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.last_failure_at = None;
                inner.last_failure_ms = None;
            }
            inner.to_row(backend)
        };
        self.store.put(row).await;
    }

    /// `onFailure` (the Closed/HalfOpen/Open transition table).
    pub async fn on_failure(&self, backend: &BackendId) {
        let row = {
            let mut guard = self.backends.lock().expect("breaker mutex poisoned");
            let inner = guard.entry(backend.clone()).or_insert_with(Inner::closed);
            inner.probe_in_flight = false;
            let now = self.clock.now();
            let now_ms = self.clock.now_ms();

            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.failure_threshold {
                        inner.state = CircuitState::Open;
                        inner.last_failure_at = Some(now);
                        inner.last_failure_ms = Some(now_ms);
                    }
                }
                CircuitState::HalfOpen => {
                    inner.state = CircuitState::Open;
                    inner.last_failure_at = Some(now);
                    inner.last_failure_ms = Some(now_ms);
                }
                CircuitState::Open => {
                    inner.last_failure_at = Some(now);
                    inner.last_failure_ms = Some(now_ms);
                }
            }
            inner.to_row(backend)
        };
        self.store.put(row).await;
    }

    pub fn state(&self, backend: &BackendId) -> CircuitState {
        let mut guard = self.backends.lock().expect("breaker mutex poisoned");
        guard.entry(backend.clone()).or_insert_with(Inner::closed).state
    }

    /// Administrative reset used in tests and by the debug CLI.
    pub async fn reset_all(&self) {
        self.backends.lock().expect("breaker mutex poisoned").clear();
        self.store.clear().await;
    }

    /// Released as part of graceful shutdown.
    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[async_trait::async_trait]
impl crate::config::AvailabilityOracle for CircuitBreaker {
    async fn is_available(&self, id: &BackendId) -> bool {
        self.is_available(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::circuit_breaker::store::InMemoryBreakerStore;

    fn breaker() -> (CircuitBreaker, Arc<FakeClock>) {
        let clock = FakeClock::new();
        let breaker = CircuitBreaker::new(Arc::new(InMemoryBreakerStore::new()), clock.clone());
        (breaker, clock)
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let (breaker, _clock) = breaker();
        let backend = BackendId::new("ask-gemini");
        assert!(breaker.is_available(&backend).await);
        assert_eq!(breaker.state(&backend), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_trips_open_after_threshold_failures() {
        let (breaker, _clock) = breaker();
        let backend = BackendId::new("ask-gemini");
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            breaker.on_failure(&backend).await;
        }
        assert_eq!(breaker.state(&backend), CircuitState::Open);
        assert!(!breaker.is_available(&backend).await);
    }

    #[tokio::test]
    async fn test_recovery_window() {
        let (breaker, clock) = breaker();
        let backend = BackendId::new("ask-gemini");
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            breaker.on_failure(&backend).await;
        }
        assert!(!breaker.is_available(&backend).await);

        clock.advance(DEFAULT_RESET_WINDOW - Duration::from_secs(1));
        assert!(!breaker.is_available(&backend).await);

        clock.advance(Duration::from_secs(2));
        assert!(breaker.is_available(&backend).await);
        assert_eq!(breaker.state(&backend), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_exclusivity() {
        let (breaker, clock) = breaker();
        let backend = BackendId::new("ask-gemini");
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            breaker.on_failure(&backend).await;
        }
        clock.advance(DEFAULT_RESET_WINDOW + Duration::from_secs(1));

        let first = breaker.is_available(&backend).await;
        let second = breaker.is_available(&backend).await;
        assert!(first);
        assert!(!second, "only the first caller may observe available during HALF_OPEN");

        breaker.on_success(&backend).await;
        assert_eq!(breaker.state(&backend), CircuitState::Closed);
        assert!(breaker.is_available(&backend).await);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (breaker, clock) = breaker();
        let backend = BackendId::new("ask-gemini");
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            breaker.on_failure(&backend).await;
        }
        clock.advance(DEFAULT_RESET_WINDOW + Duration::from_secs(1));
        assert!(breaker.is_available(&backend).await);

        breaker.on_failure(&backend).await;
        assert_eq!(breaker.state(&backend), CircuitState::Open);
        assert!(!breaker.is_available(&backend).await);
    }

    #[tokio::test]
    async fn test_reset_all_clears_state() {
        let (breaker, _clock) = breaker();
        let backend = BackendId::new("ask-gemini");
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            breaker.on_failure(&backend).await;
        }
        breaker.reset_all().await;
        assert_eq!(breaker.state(&backend), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unseen_backend_on_restart_assumed_closed() {
        let store = Arc::new(InMemoryBreakerStore::new());
        let clock = FakeClock::new();
        let breaker = CircuitBreaker::new(store, clock);
        let backend = BackendId::new("ask-never-seen");
        breaker.hydrate(&backend).await;
        assert_eq!(breaker.state(&backend), CircuitState::Closed);
    }
}
