//! Audit Sink.
//!
//! Persisted as an append-only JSON-lines file, since audit logs are
//! write-mostly. `update_outcome` is the one operation that must locate
//! and rewrite a single prior entry; it keeps an in-memory copy of all
//! entries to avoid rescanning the file, flushing the whole document back
//! out via the same temp-file-then-rename atomicity used for the breaker
//! store's snapshot writes.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::{AuditEntry, Outcome};

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a new entry. Returning `Err` signals a fail-closed condition
    /// to the permission manager: if this write fails, the guarded
    /// operation must never be allowed to proceed.
    async fn append(&self, entry: AuditEntry) -> Result<(), String>;

    async fn update_outcome(&self, id: &str, outcome: Outcome, error_message: Option<String>);

    async fn query(&self, workflow_id: Option<&str>, operation: Option<&str>) -> Vec<AuditEntry>;

    async fn close(&self);
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: Mutex<Vec<AuditEntry>>,
    /// When set, `append` fails every call. Used by tests exercising the
    /// fail-closed path.
    force_reject: std::sync::atomic::AtomicBool,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_writes(&self, reject: bool) {
        self.force_reject.store(reject, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.lock().expect("audit store mutex poisoned").clone()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), String> {
        if self.force_reject.load(std::sync::atomic::Ordering::SeqCst) {
            return Err("audit store rejected write".to_string());
        }
        self.entries.lock().expect("audit store mutex poisoned").push(entry);
        Ok(())
    }

    async fn update_outcome(&self, id: &str, outcome: Outcome, error_message: Option<String>) {
        let mut entries = self.entries.lock().expect("audit store mutex poisoned");
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.outcome = outcome;
            entry.error_message = error_message;
        }
    }

    async fn query(&self, workflow_id: Option<&str>, operation: Option<&str>) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .expect("audit store mutex poisoned")
            .iter()
            .filter(|e| workflow_id.map(|w| e.workflow_id.as_deref() == Some(w)).unwrap_or(true))
            .filter(|e| operation.map(|op| format!("{:?}", e.operation) == op).unwrap_or(true))
            .cloned()
            .collect()
    }

    async fn close(&self) {}
}

/// JSON-lines append-only file, with an in-memory index kept for
/// `update_outcome`/`query` so they never need to re-scan the file.
pub struct JsonLinesAuditStore {
    path: PathBuf,
    entries: Mutex<Vec<AuditEntry>>,
}

impl JsonLinesAuditStore {
    pub async fn open(path: PathBuf) -> Self {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents
                .lines()
                .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    async fn rewrite(&self, snapshot: Vec<AuditEntry>) {
        let mut buf = Vec::new();
        for entry in &snapshot {
            if let Ok(mut line) = serde_json::to_vec(entry) {
                line.push(b'\n');
                buf.extend_from_slice(&line);
            }
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");
        if let Err(err) = tokio::fs::write(&tmp_path, &buf).await {
            tracing::warn!(error = %err, "failed writing audit store temp file");
            return;
        }
        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            tracing::warn!(error = %err, "failed renaming audit store temp file");
        }
    }
}

#[async_trait]
impl AuditStore for JsonLinesAuditStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), String> {
        let mut line = serde_json::to_vec(&entry).map_err(|e| e.to_string())?;
        line.push(b'\n');

        use tokio::io::AsyncWriteExt;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await;
        match file {
            Ok(mut file) => {
                file.write_all(&line).await.map_err(|e| e.to_string())?;
            }
            Err(err) => return Err(err.to_string()),
        }

        self.entries.lock().expect("audit store mutex poisoned").push(entry);
        Ok(())
    }

    async fn update_outcome(&self, id: &str, outcome: Outcome, error_message: Option<String>) {
        let snapshot = {
            let mut entries = self.entries.lock().expect("audit store mutex poisoned");
            if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                entry.outcome = outcome;
                entry.error_message = error_message;
            }
            entries.clone()
        };
        self.rewrite(snapshot).await;
    }

    async fn query(&self, workflow_id: Option<&str>, operation: Option<&str>) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .expect("audit store mutex poisoned")
            .iter()
            .filter(|e| workflow_id.map(|w| e.workflow_id.as_deref() == Some(w)).unwrap_or(true))
            .filter(|e| operation.map(|op| format!("{:?}", e.operation) == op).unwrap_or(true))
            .cloned()
            .collect()
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AutonomyLevel, OperationKind};

    fn entry(id: &str) -> AuditEntry {
        AuditEntry {
            id: id.to_string(),
            timestamp_ms: 0,
            workflow_name: "review".to_string(),
            workflow_id: Some("wf-1".to_string()),
            autonomy_level: AutonomyLevel::Medium,
            operation: OperationKind::GitCommit,
            target: "ask-gemini".to_string(),
            approved: true,
            outcome: Outcome::Pending,
            executor: "core".to_string(),
            error_message: None,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_append_and_update_outcome() {
        let store = InMemoryAuditStore::new();
        store.append(entry("a1")).await.unwrap();
        store.update_outcome("a1", Outcome::Success, None).await;
        let found = store.snapshot();
        assert_eq!(found[0].outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn test_reject_writes_fails_closed() {
        let store = InMemoryAuditStore::new();
        store.reject_writes(true);
        let result = store.append(entry("a2")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_json_lines_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let store = JsonLinesAuditStore::open(path.clone()).await;
            store.append(entry("a1")).await.unwrap();
        }
        let reopened = JsonLinesAuditStore::open(path).await;
        let results = reopened.query(Some("wf-1"), None).await;
        assert_eq!(results.len(), 1);
    }
}
