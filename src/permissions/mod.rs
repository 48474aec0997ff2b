//! Permission Manager. Four ordered autonomy levels gate a closed set of
//! operation kinds; every decision is recorded to the audit sink *before*
//! the guarded operation is allowed to proceed (fail-closed).

pub mod audit;

use std::sync::Arc;

use uuid::Uuid;

pub use audit::{AuditStore, InMemoryAuditStore};

use crate::clock::Clock;
use crate::error::OrchestratorError;
use crate::model::{AutonomyLevel, AuditEntry, OperationKind, Outcome};

/// Operation -> required autonomy level. A `const` array checked with a
/// linear scan: the set is closed and tiny (ten variants), so a `HashMap`
/// would be needless indirection.
const REQUIRED_LEVEL: &[(OperationKind, AutonomyLevel)] = &[
    (OperationKind::ReadFile, AutonomyLevel::ReadOnly),
    (OperationKind::GitRead, AutonomyLevel::ReadOnly),
    (OperationKind::WriteFile, AutonomyLevel::Low),
    (OperationKind::ExternalApi, AutonomyLevel::Low),
    (OperationKind::McpCall, AutonomyLevel::Low),
    (OperationKind::GitBranch, AutonomyLevel::Medium),
    (OperationKind::GitCommit, AutonomyLevel::Medium),
    (OperationKind::ExecuteCommand, AutonomyLevel::Medium),
    (OperationKind::InstallDependency, AutonomyLevel::High),
    (OperationKind::GitPush, AutonomyLevel::High),
];

fn required_level(op: OperationKind) -> AutonomyLevel {
    REQUIRED_LEVEL
        .iter()
        .find(|(kind, _)| *kind == op)
        .map(|(_, level)| *level)
        .expect("every OperationKind has an entry in REQUIRED_LEVEL")
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub allowed: bool,
    pub required_level: AutonomyLevel,
    pub current_level: AutonomyLevel,
    pub reason: Option<String>,
}

/// Sentinels read once at [`crate::deps::Dependencies`] construction time,
/// not per call: re-reading process environment per call is both
/// unnecessary and unsound under concurrent mutation.
#[derive(Debug, Clone, Copy)]
pub struct SafeguardSentinels {
    pub dev_mode: bool,
    pub unlock_present: bool,
}

impl SafeguardSentinels {
    pub fn from_env() -> Self {
        Self {
            dev_mode: std::env::var("UNITAI_DEV_MODE").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false),
            unlock_present: std::env::var("UNITAI_UNSAFE_UNLOCK").is_ok(),
        }
    }
}

pub struct PermissionManager {
    audit: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
    sentinels: SafeguardSentinels,
}

impl PermissionManager {
    pub fn new(audit: Arc<dyn AuditStore>, clock: Arc<dyn Clock>, sentinels: SafeguardSentinels) -> Self {
        Self { audit, clock, sentinels }
    }

    /// `check(currentLevel, op) -> {allowed, requiredLevel, currentLevel, reason?}`
    pub fn check(&self, current_level: AutonomyLevel, op: OperationKind) -> CheckResult {
        let required = required_level(op);
        let allowed = current_level >= required;
        CheckResult {
            allowed,
            required_level: required,
            current_level,
            reason: if allowed {
                None
            } else {
                Some(format!(
                    "operation requires autonomy level {required:?}, current is {current_level:?}"
                ))
            },
        }
    }

    /// `assert(currentLevel, op, context, workflowName, workflowId)`.
    pub async fn assert(
        &self,
        current_level: AutonomyLevel,
        op: OperationKind,
        target: &str,
        workflow_name: &str,
        workflow_id: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let result = self.check(current_level, op);

        let entry_id = Uuid::new_v4().to_string();
        let entry = AuditEntry {
            id: entry_id.clone(),
            timestamp_ms: self.clock.now_ms(),
            workflow_name: workflow_name.to_string(),
            workflow_id: workflow_id.map(str::to_string),
            autonomy_level: current_level,
            operation: op,
            target: target.to_string(),
            approved: result.allowed,
            outcome: Outcome::Pending,
            executor: "core".to_string(),
            error_message: None,
            metadata: serde_json::Value::Null,
        };

        self.audit
            .append(entry)
            .await
            .map_err(OrchestratorError::AuditWriteFailure)?;

        if !result.allowed {
            return Err(OrchestratorError::PermissionDenied {
                operation: format!("{op:?}"),
                current: current_level,
                required: result.required_level,
                reason: result.reason.unwrap_or_default(),
            });
        }

        Ok(entry_id)
    }

    /// Caller-facing follow-up once the guarded operation completes.
    pub async fn record_outcome(&self, entry_id: &str, outcome: Outcome, error_message: Option<String>) {
        self.audit.update_outcome(entry_id, outcome, error_message).await;
    }

    /// Released as part of graceful shutdown.
    pub async fn close(&self) {
        self.audit.close().await;
    }

    /// Reporting query, not in the critical path.
    pub async fn audit_query(&self, workflow_id: Option<&str>, operation: Option<&str>) -> Vec<AuditEntry> {
        self.audit.query(workflow_id, operation).await
    }

    /// `autoApprove`/`skipPermissionsUnsafe` safeguard: three conditions
    /// required together before either flag is honored.
    pub async fn check_unsafe_safeguard(
        &self,
        current_level: AutonomyLevel,
        flag_name: &str,
        workflow_name: &str,
        workflow_id: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let violation = if current_level != AutonomyLevel::High {
            Some("requires autonomy level High".to_string())
        } else if !self.sentinels.dev_mode {
            Some("development-mode sentinel not set".to_string())
        } else if !self.sentinels.unlock_present {
            Some("unlock environment variable not set".to_string())
        } else {
            None
        };

        if let Some(reason) = violation {
            let entry = AuditEntry {
                id: Uuid::new_v4().to_string(),
                timestamp_ms: self.clock.now_ms(),
                workflow_name: workflow_name.to_string(),
                workflow_id: workflow_id.map(str::to_string),
                autonomy_level: current_level,
                operation: OperationKind::ExecuteCommand,
                target: flag_name.to_string(),
                approved: false,
                outcome: Outcome::Failure,
                executor: "core".to_string(),
                error_message: Some(reason.clone()),
                metadata: serde_json::Value::Null,
            };
            let _ = self.audit.append(entry).await;
            return Err(OrchestratorError::SafeguardViolation {
                flag: flag_name.to_string(),
                reason,
            });
        }

        Ok(())
    }
}
