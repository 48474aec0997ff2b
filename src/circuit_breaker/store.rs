//! Circuit-breaker persistence.
//!
//! Atomic-JSON temp-file-then-rename writes, backed by a single JSON
//! document keyed by backend id. Loss of the store or an absent row is
//! tolerated: the breaker assumes CLOSED with zero failures for anything
//! it can't find.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use super::BreakerRow;
use crate::model::BackendId;

#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn get(&self, backend: &BackendId) -> Option<BreakerRow>;
    async fn put(&self, row: BreakerRow);
    async fn all(&self) -> Vec<BreakerRow>;
    async fn clear(&self);
    async fn close(&self);
}

/// In-memory store, used by tests and as a degraded fallback when the file
/// store can't be opened.
#[derive(Default)]
pub struct InMemoryBreakerStore {
    rows: Mutex<HashMap<String, BreakerRow>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for InMemoryBreakerStore {
    async fn get(&self, backend: &BackendId) -> Option<BreakerRow> {
        self.rows
            .lock()
            .expect("breaker store mutex poisoned")
            .get(backend.as_str())
            .cloned()
    }

    async fn put(&self, row: BreakerRow) {
        self.rows
            .lock()
            .expect("breaker store mutex poisoned")
            .insert(row.backend_name.clone(), row);
    }

    async fn all(&self) -> Vec<BreakerRow> {
        self.rows
            .lock()
            .expect("breaker store mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    async fn clear(&self) {
        self.rows.lock().expect("breaker store mutex poisoned").clear();
    }

    async fn close(&self) {}
}

/// JSON-file-backed store: one document, a map keyed by backend name,
/// written atomically via a temp file then an fs rename.
pub struct JsonFileBreakerStore {
    path: PathBuf,
    rows: Mutex<HashMap<String, BreakerRow>>,
}

impl JsonFileBreakerStore {
    pub async fn open(path: PathBuf) -> Self {
        let rows = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str::<HashMap<String, BreakerRow>>(&contents)
                .unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "circuit breaker store malformed, starting empty");
                    HashMap::new()
                }),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            rows: Mutex::new(rows),
        }
    }

    async fn flush(&self, snapshot: HashMap<String, BreakerRow>) {
        let Ok(serialized) = serde_json::to_vec_pretty(&snapshot) else {
            return;
        };
        let tmp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(err) = tokio::fs::write(&tmp_path, &serialized).await {
            tracing::warn!(error = %err, "failed writing circuit breaker store temp file");
            return;
        }
        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            tracing::warn!(error = %err, "failed renaming circuit breaker store temp file");
        }
    }
}

#[async_trait]
impl BreakerStore for JsonFileBreakerStore {
    async fn get(&self, backend: &BackendId) -> Option<BreakerRow> {
        self.rows
            .lock()
            .expect("breaker store mutex poisoned")
            .get(backend.as_str())
            .cloned()
    }

    async fn put(&self, row: BreakerRow) {
        let snapshot = {
            let mut guard = self.rows.lock().expect("breaker store mutex poisoned");
            guard.insert(row.backend_name.clone(), row);
            guard.clone()
        };
        self.flush(snapshot).await;
    }

    async fn all(&self) -> Vec<BreakerRow> {
        self.rows
            .lock()
            .expect("breaker store mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    async fn clear(&self) {
        self.rows.lock().expect("breaker store mutex poisoned").clear();
        self.flush(HashMap::new()).await;
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str) -> BreakerRow {
        BreakerRow {
            backend_name: name.to_string(),
            state: super::super::CircuitState::Closed,
            failures: 0,
            last_failure_time_ms: None,
        }
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let store = InMemoryBreakerStore::new();
        store.put(row("ask-gemini")).await;
        let fetched = store.get(&BackendId::new("ask-gemini")).await.unwrap();
        assert_eq!(fetched.backend_name, "ask-gemini");
        assert!(store.get(&BackendId::new("ask-missing")).await.is_none());
    }

    #[tokio::test]
    async fn test_json_file_store_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker.json");

        {
            let store = JsonFileBreakerStore::open(path.clone()).await;
            store.put(row("ask-gemini")).await;
        }

        let reopened = JsonFileBreakerStore::open(path).await;
        let fetched = reopened.get(&BackendId::new("ask-gemini")).await;
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn test_clear_truncates_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker.json");
        let store = JsonFileBreakerStore::open(path).await;
        store.put(row("ask-gemini")).await;
        store.clear().await;
        assert!(store.all().await.is_empty());
    }
}
