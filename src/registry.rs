//! Backend Registry: a process-singleton keyed by [`BackendId`], populated
//! once at startup from a static descriptor list.

use dashmap::DashMap;

use crate::error::OrchestratorError;
use crate::model::{BackendDescriptor, BackendId};

/// Read-mostly store of registered backend descriptors. Populated once at
/// startup; later reads need no locking.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: DashMap<BackendId, BackendDescriptor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
        }
    }

    /// Idempotent: re-registering an id overwrites its descriptor.
    pub fn register(&self, descriptor: BackendDescriptor) {
        self.backends.insert(descriptor.id.clone(), descriptor);
    }

    pub fn get(&self, id: &BackendId) -> Option<BackendDescriptor> {
        self.backends.get(id).map(|entry| entry.value().clone())
    }

    pub fn try_get(&self, id: &BackendId) -> Result<BackendDescriptor, OrchestratorError> {
        self.get(id)
            .ok_or_else(|| OrchestratorError::UnknownBackend(id.clone()))
    }

    pub fn all(&self) -> Vec<BackendDescriptor> {
        self.backends.iter().map(|e| e.value().clone()).collect()
    }

    pub fn all_ids(&self) -> Vec<BackendId> {
        self.backends.iter().map(|e| e.key().clone()).collect()
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.backends.contains_key(id)
    }

    /// The whitelist of spawnable command names, built from every registered
    /// descriptor.
    pub fn command_whitelist(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|e| e.value().command_name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Capabilities, FileMode, OutputFormatSupport};

    fn descriptor(id: &str, command: &str) -> BackendDescriptor {
        BackendDescriptor {
            id: BackendId::new(id),
            command_name: command.to_string(),
            capabilities: Capabilities {
                file_mode: FileMode::CliFlag,
                supports_output_format: OutputFormatSupport::Both,
                accepts_auto_approve: true,
                default_timeout_ms: 60_000,
            },
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = BackendRegistry::new();
        registry.register(descriptor("ask-gemini", "gemini"));
        assert!(registry.get(&BackendId::new("ask-gemini")).is_some());
        assert!(registry.get(&BackendId::new("ask-missing")).is_none());
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = BackendRegistry::new();
        registry.register(descriptor("ask-gemini", "gemini"));
        registry.register(descriptor("ask-gemini", "gemini-v2"));
        assert_eq!(registry.all().len(), 1);
        assert_eq!(
            registry.get(&BackendId::new("ask-gemini")).unwrap().command_name,
            "gemini-v2"
        );
    }

    #[test]
    fn test_unknown_id_fails() {
        let registry = BackendRegistry::new();
        let err = registry.try_get(&BackendId::new("ask-ghost")).unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownBackend(_)));
    }

    #[test]
    fn test_command_whitelist() {
        let registry = BackendRegistry::new();
        registry.register(descriptor("ask-gemini", "gemini"));
        registry.register(descriptor("ask-qwen", "qwen"));
        let mut whitelist = registry.command_whitelist();
        whitelist.sort();
        assert_eq!(whitelist, vec!["gemini".to_string(), "qwen".to_string()]);
    }
}
