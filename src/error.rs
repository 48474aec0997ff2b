use thiserror::Error;

use crate::model::BackendId;

/// Closed error taxonomy for the orchestration core.
///
/// Every variant carries enough context for a caller to build a user-visible
/// message identifying the failing backend(s) without re-parsing strings.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("backend '{0}' is not registered")]
    UnknownBackend(BackendId),

    #[error("backend '{backend}' failed transiently: {reason}")]
    Transient { backend: BackendId, reason: String },

    #[error("backend '{backend}' reported quota exhaustion: {reason}")]
    QuotaExceeded { backend: BackendId, reason: String },

    #[error("backend '{backend}' denied the request: {reason}")]
    PermissionError { backend: BackendId, reason: String },

    #[error("backend '{backend}' exited with code {exit_code:?}: {stderr_tail}")]
    BackendFailure {
        backend: BackendId,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("operation '{operation}' denied at autonomy level '{current:?}' (requires '{required:?}'): {reason}")]
    PermissionDenied {
        operation: String,
        current: crate::model::AutonomyLevel,
        required: crate::model::AutonomyLevel,
        reason: String,
    },

    #[error("safeguard violation for '{flag}': {reason}")]
    SafeguardViolation { flag: String, reason: String },

    #[error("audit write failed, aborting guarded operation: {0}")]
    AuditWriteFailure(String),

    #[error("no backend available among {tried:?}")]
    AllBackendsUnavailable { tried: Vec<BackendId> },

    #[error("retries exhausted after trying {tried:?}: {last_error}")]
    ExhaustedRetries {
        tried: Vec<BackendId>,
        last_error: String,
    },

    #[error("all backends failed: {0:?}")]
    AllBackendsFailed(std::collections::BTreeMap<BackendId, String>),

    #[error("no fallback backend remains untried")]
    NoFallbackRemaining,

    #[error("backend '{0}' does not support this request")]
    UnsupportedBackend(BackendId),

    #[error("request cancelled")]
    Cancelled,

    #[error("subprocess timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("backend produced an empty response")]
    EmptyResponse,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Whether the circuit breaker / fallback orchestrator should treat this
    /// as a transient failure worth retrying with another backend.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Transient { .. }
                | OrchestratorError::QuotaExceeded { .. }
                | OrchestratorError::BackendFailure { .. }
                | OrchestratorError::Timeout(_)
                | OrchestratorError::EmptyResponse
        )
    }

    /// Whether this failure must never be retried against a different
    /// backend: a non-recoverable, caller-visible error.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, OrchestratorError::UnsupportedBackend(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        let backend = BackendId::new("ask-gemini");
        assert!(
            OrchestratorError::Transient {
                backend: backend.clone(),
                reason: "timeout".into()
            }
            .is_retryable()
        );
        assert!(OrchestratorError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(!OrchestratorError::UnknownBackend(backend.clone()).is_retryable());
        assert!(!OrchestratorError::Cancelled.is_retryable());
    }

    #[test]
    fn test_is_unsupported() {
        let backend = BackendId::new("ask-gemini");
        assert!(OrchestratorError::UnsupportedBackend(backend.clone()).is_unsupported());
        assert!(!OrchestratorError::Timeout(std::time::Duration::from_secs(1)).is_unsupported());
    }

    #[test]
    fn test_error_messages_contain_backend_name() {
        let backend = BackendId::new("ask-cursor");
        let err = OrchestratorError::BackendFailure {
            backend: backend.clone(),
            exit_code: Some(1),
            stderr_tail: "boom".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ask-cursor"));
        assert!(msg.contains("boom"));
    }
}
