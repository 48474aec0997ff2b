//! Scoped Resource Lifecycle: assembles every long-lived handle once at
//! startup and releases them, in reverse acquisition order, on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::store::JsonFileBreakerStore;
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::metrics::store::JsonLinesMetricsStore;
use crate::metrics::MetricsRecorder;
use crate::model::{BackendDescriptor, BackendId, Capabilities, FileMode, OutputFormatSupport};
use crate::permissions::audit::JsonLinesAuditStore;
use crate::permissions::{PermissionManager, SafeguardSentinels};
use crate::registry::BackendRegistry;

fn unitai_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".unitai")
}

/// Built-in backend descriptors registered at every startup. Operators add
/// more via config but these five ship enabled by default.
fn builtin_descriptors() -> Vec<BackendDescriptor> {
    vec![
        BackendDescriptor {
            id: BackendId::new("ask-gemini"),
            command_name: "gemini".to_string(),
            capabilities: Capabilities {
                file_mode: FileMode::CliFlag,
                supports_output_format: OutputFormatSupport::Both,
                accepts_auto_approve: true,
                default_timeout_ms: 120_000,
            },
        },
        BackendDescriptor {
            id: BackendId::new("ask-qwen"),
            command_name: "qwen".to_string(),
            capabilities: Capabilities {
                file_mode: FileMode::CliFlag,
                supports_output_format: OutputFormatSupport::Both,
                accepts_auto_approve: true,
                default_timeout_ms: 120_000,
            },
        },
        BackendDescriptor {
            id: BackendId::new("ask-droid"),
            command_name: "droid".to_string(),
            capabilities: Capabilities {
                file_mode: FileMode::EmbedInPrompt,
                supports_output_format: OutputFormatSupport::Text,
                accepts_auto_approve: true,
                default_timeout_ms: 180_000,
            },
        },
        BackendDescriptor {
            id: BackendId::new("ask-rovodev"),
            command_name: "acli".to_string(),
            capabilities: Capabilities {
                file_mode: FileMode::CliFlag,
                supports_output_format: OutputFormatSupport::Text,
                accepts_auto_approve: false,
                default_timeout_ms: 180_000,
            },
        },
        BackendDescriptor {
            id: BackendId::new("ask-cursor"),
            command_name: "cursor-agent".to_string(),
            capabilities: Capabilities {
                file_mode: FileMode::CliFlag,
                supports_output_format: OutputFormatSupport::Json,
                accepts_auto_approve: true,
                default_timeout_ms: 120_000,
            },
        },
    ]
}

/// Process-wide handles assembled once at startup and passed down;
/// everything else borrows.
pub struct Dependencies {
    pub config: Arc<Config>,
    pub registry: Arc<BackendRegistry>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<MetricsRecorder>,
    pub permissions: Arc<PermissionManager>,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancellationToken,
}

impl Dependencies {
    /// Opens the audit store, breaker store, and metrics store, builds the
    /// registry, loads config, and wires the clock, in the order
    /// `shutdown()` releases in reverse.
    pub async fn init() -> Self {
        let home = unitai_home();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let config = Arc::new(Config::load().await);
        let registry = BackendRegistry::new();
        for descriptor in builtin_descriptors() {
            registry.register(descriptor);
        }
        let registry = Arc::new(registry);

        let breaker_store = Arc::new(JsonFileBreakerStore::open(home.join("circuit_breaker.json")).await);
        let circuit_breaker = Arc::new(CircuitBreaker::new(breaker_store, clock.clone()));

        let metrics_store = Arc::new(JsonLinesMetricsStore::open(home.join("metrics.jsonl")).await);
        let metrics = Arc::new(MetricsRecorder::with_clock(metrics_store, clock.clone()));

        let audit_store = Arc::new(JsonLinesAuditStore::open(home.join("audit.jsonl")).await);
        let sentinels = SafeguardSentinels::from_env();
        let permissions = Arc::new(PermissionManager::new(audit_store, clock.clone(), sentinels));

        Self {
            config,
            registry,
            circuit_breaker,
            metrics,
            permissions,
            clock,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops accepting new requests, cancels outstanding work, and releases
    /// the three persistent stores in reverse acquisition order.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        tracing::info!("shutting down: cancellation propagated to all outstanding work");

        // Release in reverse acquisition order: audit, then metrics, then
        // the circuit breaker (acquired breaker -> metrics -> audit in
        // `init`).
        self.permissions.close().await;
        self.metrics.close().await;
        self.circuit_breaker.close().await;
    }
}
