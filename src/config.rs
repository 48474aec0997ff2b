//! Configuration & Role Resolver.
//!
//! Loaded once per process from `$HOME/.unitai/config.json` and cached in
//! the [`crate::deps::Dependencies`] container. A missing or malformed file
//! is logged and treated as absent, never fatal.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::{BackendId, BackendsConfig, Preferences, RolesConfig, WorkflowDefaultsMap};

/// Operator-facing configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub roles: RolesConfig,
    #[serde(default)]
    pub fallback_priority: Option<Vec<BackendId>>,
    #[serde(default)]
    pub workflow_defaults: WorkflowDefaultsMap,
    #[serde(default)]
    pub preferences: Preferences,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backends: BackendsConfig::default(),
            roles: RolesConfig::default(),
            fallback_priority: None,
            workflow_defaults: WorkflowDefaultsMap::default(),
            preferences: Preferences::default(),
        }
    }
}

/// Default fallback sequence when the config omits one.
fn default_fallback_priority() -> Vec<BackendId> {
    vec![
        BackendId::new("ask-gemini"),
        BackendId::new("ask-qwen"),
        BackendId::new("ask-droid"),
        BackendId::new("ask-rovodev"),
    ]
}

/// Hard-coded role defaults used when the config omits a role.
fn default_role_backend(role: &str) -> Option<BackendId> {
    match role {
        "architect" => Some(BackendId::new("ask-gemini")),
        "implementer" => Some(BackendId::new("ask-droid")),
        "tester" => Some(BackendId::new("ask-qwen")),
        _ => None,
    }
}

/// Anything able to answer "is this backend currently admitting calls".
/// Implemented by the circuit breaker; kept as a trait here so `config`
/// never has to depend on `circuit_breaker` directly.
#[async_trait::async_trait]
pub trait AvailabilityOracle: Send + Sync {
    async fn is_available(&self, id: &BackendId) -> bool;
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".unitai")
        .join("config.json")
}

impl Config {
    /// Load from `$HOME/.unitai/config.json`. Missing file or malformed JSON
    /// both log and fall back to `Config::default()` rather than aborting
    /// startup.
    pub async fn load() -> Self {
        Self::load_from(&default_config_path()).await
    }

    pub async fn load_from(path: &Path) -> Self {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "config file unreadable, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_str::<Config>(&contents) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "config file malformed, using defaults");
                Self::default()
            }
        }
    }

    /// `roleBackend(role) -> id`.
    pub fn role_backend(&self, role: &str) -> Option<BackendId> {
        let configured = match role {
            "architect" => self.roles.architect.clone(),
            "implementer" => self.roles.implementer.clone(),
            "tester" => self.roles.tester.clone(),
            _ => None,
        };
        configured.or_else(|| default_role_backend(role))
    }

    /// `fallbackPriority() -> [id]`.
    pub fn fallback_priority(&self) -> Vec<BackendId> {
        self.fallback_priority
            .clone()
            .unwrap_or_else(default_fallback_priority)
    }

    /// `workflowBackends(name, defaults) -> [id]`: per-workflow override
    /// filtered against the registry; empty override yields `defaults`,
    /// unknown ids are dropped with a warning.
    pub fn workflow_backends(
        &self,
        name: &str,
        defaults: &[BackendId],
        known: &[BackendId],
    ) -> Vec<BackendId> {
        let overridden = self
            .workflow_defaults
            .get(name)
            .and_then(|wf| wf.backends.clone());

        let Some(ids) = overridden else {
            return defaults.to_vec();
        };
        if ids.is_empty() {
            return defaults.to_vec();
        }

        ids.into_iter()
            .filter(|id| {
                let ok = known.contains(id);
                if !ok {
                    tracing::warn!(backend = %id, workflow = name, "dropping unknown backend from workflow override");
                }
                ok
            })
            .collect()
    }

    /// `filterAvailable(ids, cb) -> [id]`.
    pub async fn filter_available(
        &self,
        ids: &[BackendId],
        oracle: &dyn AvailabilityOracle,
    ) -> Vec<BackendId> {
        if !self.preferences.prefer_available {
            return ids.to_vec();
        }
        let mut kept = Vec::with_capacity(ids.len());
        for id in ids {
            if oracle.is_available(id).await {
                kept.push(id.clone());
            }
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysAvailable;
    #[async_trait::async_trait]
    impl AvailabilityOracle for AlwaysAvailable {
        async fn is_available(&self, _id: &BackendId) -> bool {
            true
        }
    }

    struct NoneAvailable;
    #[async_trait::async_trait]
    impl AvailabilityOracle for NoneAvailable {
        async fn is_available(&self, _id: &BackendId) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_missing_file_yields_default() {
        let config = Config::load_from(Path::new("/nonexistent/path/config.json")).await;
        assert_eq!(config.role_backend("architect"), Some(BackendId::new("ask-gemini")));
    }

    #[tokio::test]
    async fn test_malformed_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let config = Config::load_from(&path).await;
        assert_eq!(config.fallback_priority(), default_fallback_priority());
    }

    #[tokio::test]
    async fn test_roundtrip_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(
            &path,
            br#"{"roles": {"architect": "ask-custom"}, "preferences": {"preferAvailable": false, "retryWithFallback": true}}"#,
        )
        .await
        .unwrap();
        let config = Config::load_from(&path).await;
        assert_eq!(config.role_backend("architect"), Some(BackendId::new("ask-custom")));
        assert_eq!(config.role_backend("implementer"), Some(BackendId::new("ask-droid")));
        assert!(!config.preferences.prefer_available);
    }

    #[test]
    fn test_default_fallback_priority() {
        let config = Config::default();
        assert_eq!(config.fallback_priority(), default_fallback_priority());
    }

    #[test]
    fn test_workflow_backends_empty_override_yields_defaults() {
        let config = Config::default();
        let defaults = vec![BackendId::new("ask-gemini")];
        let known = vec![BackendId::new("ask-gemini")];
        assert_eq!(
            config.workflow_backends("review", &defaults, &known),
            defaults
        );
    }

    #[test]
    fn test_workflow_backends_drops_unknown() {
        let mut config = Config::default();
        config.workflow_defaults.insert(
            "review".to_string(),
            crate::model::WorkflowDefaults {
                backends: Some(vec![BackendId::new("ask-gemini"), BackendId::new("ask-ghost")]),
                max_parallel: None,
                timeout_ms: None,
            },
        );
        let known = vec![BackendId::new("ask-gemini")];
        let result = config.workflow_backends("review", &[], &known);
        assert_eq!(result, vec![BackendId::new("ask-gemini")]);
    }

    #[tokio::test]
    async fn test_filter_available_respects_preference() {
        let mut config = Config::default();
        let ids = vec![BackendId::new("ask-gemini"), BackendId::new("ask-qwen")];

        config.preferences.prefer_available = true;
        assert_eq!(config.filter_available(&ids, &NoneAvailable).await.len(), 0);
        assert_eq!(config.filter_available(&ids, &AlwaysAvailable).await.len(), 2);

        config.preferences.prefer_available = false;
        assert_eq!(config.filter_available(&ids, &NoneAvailable).await.len(), 2);
    }
}
