//! Metrics Recorder. An `hdrhistogram` per (component, backend) pair for
//! all-time percentile computation, guarded by a short-held mutex
//! (`DashMap<(String, String), Mutex<Histogram<u64>>>`), plus a bounded
//! ring buffer of recent samples for windowed rate/error-rate computation
//! and exact order-statistic percentiles with ties broken by insertion
//! order, which a histogram's bucketing would destroy.

pub mod store;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use hdrhistogram::Histogram;

use crate::clock::Clock;
use crate::model::{BackendId, MetricSample, Outcome};
pub use store::{InMemoryMetricsStore, MetricsStore};

/// Bound on the in-memory ring buffer of raw samples kept for exact
/// windowed order statistics.
const DEFAULT_MAX_RECENT: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedStats {
    pub rate_per_sec: f64,
    pub error_rate: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl RedStats {
    fn empty() -> Self {
        Self {
            rate_per_sec: 0.0,
            error_rate: 0.0,
            p50_ms: 0,
            p95_ms: 0,
            p99_ms: 0,
        }
    }
}

pub struct MetricsRecorder {
    histograms: DashMap<(String, String), Mutex<Histogram<u64>>>,
    recent: Mutex<VecDeque<MetricSample>>,
    store: Arc<dyn MetricsStore>,
    clock: Arc<dyn Clock>,
}

impl MetricsRecorder {
    pub fn new(store: Arc<dyn MetricsStore>) -> Self {
        Self::with_clock(store, Arc::new(crate::clock::SystemClock))
    }

    pub fn with_clock(store: Arc<dyn MetricsStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            histograms: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(DEFAULT_MAX_RECENT)),
            store,
            clock,
        }
    }

    /// Convenience wrapper used by the fallback orchestrator's call sites.
    pub async fn record_duration(
        &self,
        backend: &BackendId,
        operation: &str,
        duration: Duration,
        outcome: Outcome,
        correlation_id: &str,
    ) {
        let sample = MetricSample {
            timestamp_ms: self.clock.now_ms(),
            component: "executor".to_string(),
            backend_id: backend.clone(),
            operation: operation.to_string(),
            duration_ms: duration.as_millis() as u64,
            outcome,
            correlation_id: correlation_id.to_string(),
        };
        self.record(sample).await;
    }

    /// `record(MetricSample)`.
    pub async fn record(&self, sample: MetricSample) {
        let key = (sample.component.clone(), sample.backend_id.to_string());
        {
            let entry = self
                .histograms
                .entry(key)
                .or_insert_with(|| Mutex::new(Histogram::<u64>::new(3).expect("valid histogram")));
            // Mutex held only for the push.
            let mut hist = entry.lock().expect("histogram mutex poisoned");
            let _ = hist.record(sample.duration_ms.max(1));
        }

        {
            let mut recent = self.recent.lock().expect("recent mutex poisoned");
            if recent.len() >= DEFAULT_MAX_RECENT {
                recent.pop_front();
            }
            recent.push_back(sample.clone());
        }

        self.store.append(sample).await;
    }

    /// `red(component, backendId?, windowMinutes) -> RedStats`.
    ///
    /// Uses the bounded ring buffer (exact order statistics, ties broken by
    /// insertion order) rather than the histogram whenever the window fits
    /// inside it; the histogram remains the fallback for all-time,
    /// unwindowed queries over more samples than the ring buffer retains.
    pub fn red(&self, component: &str, backend_id: Option<&BackendId>, window_minutes: u64) -> RedStats {
        let window = Duration::from_secs(window_minutes * 60);
        let now_ms = self.clock.now_ms();
        let window_start_ms = now_ms - window.as_millis() as i64;

        let recent = self.recent.lock().expect("recent mutex poisoned");
        let mut durations: Vec<u64> = Vec::new();
        let mut failures: u64 = 0;
        let mut total: u64 = 0;

        for sample in recent.iter() {
            if sample.component != component {
                continue;
            }
            if let Some(id) = backend_id {
                if &sample.backend_id != id {
                    continue;
                }
            }
            if sample.timestamp_ms < window_start_ms {
                continue;
            }
            total += 1;
            if sample.outcome == Outcome::Failure {
                failures += 1;
            }
            durations.push(sample.duration_ms);
        }
        drop(recent);

        if total == 0 {
            return RedStats::empty();
        }

        // stable sort: ties keep their original (insertion) relative order
        durations.sort();

        let window_secs = window.as_secs_f64().max(1.0);
        RedStats {
            rate_per_sec: total as f64 / window_secs,
            error_rate: failures as f64 / total as f64,
            p50_ms: percentile(&durations, 0.50),
            p95_ms: percentile(&durations, 0.95),
            p99_ms: percentile(&durations, 0.99),
        }
    }

    /// Released as part of graceful shutdown.
    pub async fn close(&self) {
        self.store.close().await;
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::metrics::store::InMemoryMetricsStore;

    fn recorder() -> (MetricsRecorder, Arc<FakeClock>) {
        let clock = FakeClock::new();
        let recorder = MetricsRecorder::with_clock(Arc::new(InMemoryMetricsStore::new()), clock.clone());
        (recorder, clock)
    }

    #[tokio::test]
    async fn test_red_with_no_samples_is_empty() {
        let (recorder, _clock) = recorder();
        let stats = recorder.red("executor", None, 5);
        assert_eq!(stats, RedStats::empty());
    }

    #[tokio::test]
    async fn test_red_rate_and_error_rate() {
        let (recorder, clock) = recorder();
        let backend = BackendId::new("ask-gemini");
        for i in 0..4 {
            let outcome = if i == 3 { Outcome::Failure } else { Outcome::Success };
            recorder
                .record_duration(&backend, "execute", Duration::from_millis(100 + i * 10), outcome, "corr")
                .await;
        }
        clock.advance(Duration::from_secs(1));

        let stats = recorder.red("executor", Some(&backend), 5);
        assert_eq!(stats.error_rate, 0.25);
        assert!(stats.rate_per_sec > 0.0);
    }

    #[tokio::test]
    async fn test_percentiles_are_order_statistics() {
        let (recorder, _clock) = recorder();
        let backend = BackendId::new("ask-gemini");
        for ms in [10, 20, 30, 40, 100] {
            recorder
                .record_duration(&backend, "execute", Duration::from_millis(ms), Outcome::Success, "corr")
                .await;
        }
        let stats = recorder.red("executor", Some(&backend), 60);
        assert_eq!(stats.p50_ms, 30);
        assert_eq!(stats.p99_ms, 100);
    }

    #[tokio::test]
    async fn test_window_excludes_old_samples() {
        let (recorder, clock) = recorder();
        let backend = BackendId::new("ask-gemini");
        recorder
            .record_duration(&backend, "executor", Duration::from_millis(10), Outcome::Success, "corr")
            .await;
        clock.advance(Duration::from_secs(600));
        recorder
            .record_duration(&backend, "executor", Duration::from_millis(20), Outcome::Success, "corr")
            .await;

        let stats = recorder.red("executor", Some(&backend), 1);
        assert_eq!(stats.p50_ms, 20);
    }
}
