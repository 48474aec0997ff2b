//! Metrics persistence. The in-memory tracker in `super` is authoritative
//! for queries; this trait exists so metric samples survive a restart.
//! Samples are write-mostly, so this store only ever appends (JSON Lines)
//! rather than rewriting a whole document, the same choice made for the
//! audit store.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::model::MetricSample;

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn append(&self, sample: MetricSample);
    async fn close(&self);
}

#[derive(Default)]
pub struct InMemoryMetricsStore {
    samples: Mutex<Vec<MetricSample>>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.samples.lock().expect("metrics store mutex poisoned").clone()
    }
}

#[async_trait]
impl MetricsStore for InMemoryMetricsStore {
    async fn append(&self, sample: MetricSample) {
        self.samples.lock().expect("metrics store mutex poisoned").push(sample);
    }

    async fn close(&self) {}
}

/// Append-only JSON-lines file store. A write failure is logged and
/// otherwise ignored; metrics persistence failures are non-fatal.
pub struct JsonLinesMetricsStore {
    path: PathBuf,
}

impl JsonLinesMetricsStore {
    pub async fn open(path: PathBuf) -> Self {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        Self { path }
    }
}

#[async_trait]
impl MetricsStore for JsonLinesMetricsStore {
    async fn append(&self, sample: MetricSample) {
        let Ok(mut line) = serde_json::to_vec(&sample) else {
            return;
        };
        line.push(b'\n');

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await;
        match file {
            Ok(mut file) => {
                if let Err(err) = file.write_all(&line).await {
                    tracing::warn!(error = %err, "failed appending metrics sample");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed opening metrics store for append");
            }
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackendId, Outcome};

    fn sample() -> MetricSample {
        MetricSample {
            timestamp_ms: 0,
            component: "executor".to_string(),
            backend_id: BackendId::new("ask-gemini"),
            operation: "execute".to_string(),
            duration_ms: 10,
            outcome: Outcome::Success,
            correlation_id: "corr-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_appends() {
        let store = InMemoryMetricsStore::new();
        store.append(sample()).await;
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_json_lines_store_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let store = JsonLinesMetricsStore::open(path.clone()).await;
        store.append(sample()).await;
        store.append(sample()).await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
