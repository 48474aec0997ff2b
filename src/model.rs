//! Canonical data model shared by every component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Opaque backend identity. The set of known ids is closed at startup from
/// the registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for BackendId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// How a backend consumes file references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileMode {
    CliFlag,
    EmbedInPrompt,
    None,
}

/// Output formats a backend can be asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormatSupport {
    Text,
    Json,
    Both,
    Neither,
}

/// Requested output format on a canonical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
}

/// Immutable-after-registration backend capability descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub file_mode: FileMode,
    pub supports_output_format: OutputFormatSupport,
    pub accepts_auto_approve: bool,
    pub default_timeout_ms: u64,
}

/// A registered backend. Immutable after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: BackendId,
    pub command_name: String,
    pub capabilities: Capabilities,
}

/// Four ordered autonomy levels. Declaration order is the permission
/// ordering: `ReadOnly < Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutonomyLevel {
    ReadOnly,
    Low,
    Medium,
    High,
}

/// Closed set of operation types gated by the permission manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    ReadFile,
    WriteFile,
    GitRead,
    GitCommit,
    GitBranch,
    GitPush,
    InstallDependency,
    ExecuteCommand,
    ExternalApi,
    McpCall,
}

/// A single progress chunk forwarded from the executor to a caller-supplied
/// sink. `tag` carries the `[id] ` prefix used during parallel fan-out;
/// single-backend calls leave it empty.
#[derive(Debug, Clone)]
pub struct ProgressChunk {
    pub tag: String,
    pub bytes: Vec<u8>,
    pub is_heartbeat: bool,
    pub total_bytes_so_far: u64,
}

/// Caller-supplied progress callback. Must be cheap and non-blocking;
/// heavy work should be queued elsewhere.
pub type ProgressSink = Arc<dyn Fn(ProgressChunk) + Send + Sync>;

/// What a workflow hands to the core.
#[derive(Clone)]
pub struct CanonicalRequest {
    pub backend_id: Option<BackendId>,
    pub prompt: String,
    pub attachments: Vec<String>,
    pub output_format: Option<OutputFormat>,
    pub sandbox: bool,
    pub auto_approve: bool,
    pub autonomy_level: AutonomyLevel,
    pub trusted_source: bool,
    pub session_id: Option<String>,
    pub working_dir: Option<String>,
    pub progress_sink: Option<ProgressSink>,
    pub correlation_id: String,
}

impl fmt::Debug for CanonicalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanonicalRequest")
            .field("backend_id", &self.backend_id)
            .field("prompt_len", &self.prompt.len())
            .field("attachments", &self.attachments)
            .field("output_format", &self.output_format)
            .field("sandbox", &self.sandbox)
            .field("auto_approve", &self.auto_approve)
            .field("autonomy_level", &self.autonomy_level)
            .field("trusted_source", &self.trusted_source)
            .field("session_id", &self.session_id)
            .field("working_dir", &self.working_dir)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

impl CanonicalRequest {
    /// Build a minimal request for a given prompt. Panics are never used
    /// here; callers fill in the rest via struct-update syntax.
    pub fn new(prompt: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            backend_id: None,
            prompt: prompt.into(),
            attachments: Vec::new(),
            output_format: None,
            sandbox: false,
            auto_approve: false,
            autonomy_level: AutonomyLevel::ReadOnly,
            trusted_source: false,
            session_id: None,
            working_dir: None,
            progress_sink: None,
            correlation_id: correlation_id.into(),
        }
    }
}

/// Outcome tag used throughout audit entries and metric samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Pending,
}

/// Per-workflow override of default backend selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefaults {
    #[serde(default)]
    pub backends: Option<Vec<BackendId>>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Operator preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default)]
    pub prefer_available: bool,
    #[serde(default)]
    pub retry_with_fallback: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            prefer_available: true,
            retry_with_fallback: true,
        }
    }
}

/// Role -> backend mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolesConfig {
    #[serde(default)]
    pub architect: Option<BackendId>,
    #[serde(default)]
    pub implementer: Option<BackendId>,
    #[serde(default)]
    pub tester: Option<BackendId>,
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            architect: None,
            implementer: None,
            tester: None,
        }
    }
}

/// Enabled/detected backend lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub enabled: Vec<BackendId>,
    #[serde(default)]
    pub detected: Vec<BackendId>,
}

pub type WorkflowDefaultsMap = BTreeMap<String, WorkflowDefaults>;

/// A single recorded call outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp_ms: i64,
    pub component: String,
    pub backend_id: BackendId,
    pub operation: String,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub correlation_id: String,
}

/// An append-only permission-decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp_ms: i64,
    pub workflow_name: String,
    pub workflow_id: Option<String>,
    pub autonomy_level: AutonomyLevel,
    pub operation: OperationKind,
    pub target: String,
    pub approved: bool,
    pub outcome: Outcome,
    pub executor: String,
    pub error_message: Option<String>,
    pub metadata: Value,
}
