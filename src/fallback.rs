//! Fallback / Retry Orchestrator.
//!
//! Drives the retry loop, including the critical substitution
//! `currentRequest := transform(currentRequest, next)` (never re-deriving
//! from the original request), which prevents attachment resurrection
//! across hops.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::executor::{ExecOptions, SubprocessExecutor};
use crate::metrics::MetricsRecorder;
use crate::model::{BackendId, CanonicalRequest, Outcome as MetricOutcome};
use crate::registry::BackendRegistry;
use crate::transform::transform;

/// Default number of fallback hops after the initial attempt.
pub const DEFAULT_RETRIES: u32 = 2;

/// Builds the argv passed to the subprocess executor for a transformed
/// request. Command *name* always comes from the registry's descriptor
/// (the command whitelist is keyed off the descriptor, not caller input);
/// this trait is the small per-backend "spawn with argv" adapter.
/// Descriptor capability handling itself lives in the transformer, not
/// here.
pub trait ArgvBuilder: Send + Sync {
    fn build(&self, request: &CanonicalRequest) -> Vec<String>;
}

pub struct FallbackOrchestrator {
    registry: Arc<BackendRegistry>,
    config: Arc<Config>,
    breaker: Arc<CircuitBreaker>,
    executor: Arc<SubprocessExecutor>,
    metrics: Arc<MetricsRecorder>,
    argv_builder: Arc<dyn ArgvBuilder>,
    retries: u32,
}

impl FallbackOrchestrator {
    pub fn new(
        registry: Arc<BackendRegistry>,
        config: Arc<Config>,
        breaker: Arc<CircuitBreaker>,
        executor: Arc<SubprocessExecutor>,
        metrics: Arc<MetricsRecorder>,
        argv_builder: Arc<dyn ArgvBuilder>,
    ) -> Self {
        Self {
            registry,
            config,
            breaker,
            executor,
            metrics,
            argv_builder,
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// `execute(request) -> string`. `cancel` is threaded into every
    /// subprocess this call spawns, hop after hop, so cancelling it aborts
    /// whichever backend is currently running rather than merely dropping
    /// the future that awaits it.
    pub async fn execute(
        &self,
        request: CanonicalRequest,
        cancel: CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let mut current = request;
        let mut tried: Vec<BackendId> = Vec::new();
        let mut retries_left = self.retries;
        // fallback priority is snapshotted once per call: live config edits
        // mid-call never affect an in-flight fallback chain.
        let priority = self.config.fallback_priority();

        loop {
            let Some(target_id) = current.backend_id.clone() else {
                return Err(OrchestratorError::UnknownBackend(BackendId::new("")));
            };
            let descriptor = self.registry.try_get(&target_id)?;

            if !self.breaker.is_available(&target_id).await {
                if retries_left == 0 {
                    return Err(OrchestratorError::AllBackendsUnavailable { tried });
                }
                let next = self.select_fallback(&target_id, &tried, &priority).await?;
                current = transform(&current, &next, &self.registry);
                tried.push(target_id);
                retries_left -= 1;
                continue;
            }

            let start = std::time::Instant::now();
            let argv = self.argv_builder.build(&current);
            let options = ExecOptions {
                timeout: Duration::from_millis(descriptor.capabilities.default_timeout_ms),
                progress_sink: current.progress_sink.clone(),
                working_dir: current.working_dir.clone(),
                cancel: cancel.clone(),
                ..Default::default()
            };

            match self
                .executor
                .run(&target_id, &descriptor.command_name, &argv, options)
                .await
            {
                Ok(result) => {
                    self.breaker.on_success(&target_id).await;
                    self.metrics
                        .record_duration(&target_id, "execute", start.elapsed(), MetricOutcome::Success, &current.correlation_id)
                        .await;
                    return Ok(result);
                }
                Err(OrchestratorError::UnsupportedBackend(id)) => {
                    self.metrics
                        .record_duration(&target_id, "execute", start.elapsed(), MetricOutcome::Failure, &current.correlation_id)
                        .await;
                    return Err(OrchestratorError::UnsupportedBackend(id));
                }
                Err(OrchestratorError::PermissionError { backend, reason }) => {
                    self.metrics
                        .record_duration(&target_id, "execute", start.elapsed(), MetricOutcome::Failure, &current.correlation_id)
                        .await;
                    return Err(OrchestratorError::PermissionError { backend, reason });
                }
                Err(other) => {
                    self.breaker.on_failure(&target_id).await;
                    self.metrics
                        .record_duration(&target_id, "execute", start.elapsed(), MetricOutcome::Failure, &current.correlation_id)
                        .await;
                    if retries_left == 0 {
                        return Err(OrchestratorError::ExhaustedRetries {
                            tried: {
                                tried.push(target_id);
                                tried
                            },
                            last_error: other.to_string(),
                        });
                    }
                    let next = self.select_fallback(&target_id, &tried, &priority).await?;
                    current = transform(&current, &next, &self.registry);
                    tried.push(target_id);
                    retries_left -= 1;
                    continue;
                }
            }
        }
    }

    /// `selectFallback(failed, tried)`.
    async fn select_fallback(
        &self,
        failed: &BackendId,
        tried: &[BackendId],
        priority: &[BackendId],
    ) -> Result<BackendId, OrchestratorError> {
        let mut candidates = priority
            .iter()
            .filter(|id| *id != failed && !tried.contains(id));

        let mut first_untried = None;
        for id in candidates.by_ref() {
            if first_untried.is_none() {
                first_untried = Some(id.clone());
            }
            if self.breaker.is_available(id).await {
                return Ok(id.clone());
            }
        }

        first_untried.ok_or(OrchestratorError::NoFallbackRemaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::store::InMemoryBreakerStore;
    use crate::clock::FakeClock;
    use crate::metrics::store::InMemoryMetricsStore;
    use crate::model::{BackendDescriptor, Capabilities, FileMode, OutputFormatSupport};

    struct EchoArgvBuilder;
    impl ArgvBuilder for EchoArgvBuilder {
        fn build(&self, request: &CanonicalRequest) -> Vec<String> {
            vec![request.prompt.clone()]
        }
    }

    fn make_orchestrator(commands: Vec<(&str, &str)>) -> (FallbackOrchestrator, Arc<BackendRegistry>) {
        let registry = Arc::new(BackendRegistry::new());
        let names: Vec<&str> = commands.iter().map(|(name, _)| *name).collect();
        for (name, command) in &commands {
            registry.register(BackendDescriptor {
                id: BackendId::new(format!("ask-{name}")),
                command_name: command.to_string(),
                capabilities: Capabilities {
                    file_mode: FileMode::CliFlag,
                    supports_output_format: OutputFormatSupport::Both,
                    accepts_auto_approve: true,
                    default_timeout_ms: 5_000,
                },
            });
        }
        let commands = names;

        let mut config = Config::default();
        config.fallback_priority = Some(commands.iter().map(|n| BackendId::new(format!("ask-{n}"))).collect());

        let clock = FakeClock::new();
        let breaker = Arc::new(CircuitBreaker::new(Arc::new(InMemoryBreakerStore::new()), clock));
        let executor = Arc::new(SubprocessExecutor::new(vec!["echo".to_string(), "false".to_string()]));
        let metrics = Arc::new(MetricsRecorder::new(Arc::new(InMemoryMetricsStore::new())));

        let orchestrator = FallbackOrchestrator::new(
            registry.clone(),
            Arc::new(config),
            breaker,
            executor,
            metrics,
            Arc::new(EchoArgvBuilder),
        );
        (orchestrator, registry)
    }

    #[tokio::test]
    async fn test_happy_path_single_backend() {
        let (orchestrator, _registry) = make_orchestrator(vec![("gemini", "echo")]);
        let mut req = CanonicalRequest::new("hello", "corr-1");
        req.backend_id = Some(BackendId::new("ask-gemini"));
        let result = orchestrator.execute(req, CancellationToken::new()).await.unwrap();
        assert_eq!(result.trim(), "hello");
    }

    #[tokio::test]
    async fn test_fallback_chain_uniqueness() {
        // every backend in the chain always fails, forcing a hop through all
        // three before the retries are exhausted.
        let (orchestrator, _registry) = make_orchestrator(vec![
            ("cursor", "false"),
            ("droid", "false"),
            ("gemini", "false"),
        ]);
        let mut req = CanonicalRequest::new("hello", "corr-1");
        req.backend_id = Some(BackendId::new("ask-cursor"));
        let result = orchestrator.execute(req, CancellationToken::new()).await;
        assert!(result.is_err());
        match result.unwrap_err() {
            OrchestratorError::ExhaustedRetries { tried, .. } => {
                let mut seen = std::collections::HashSet::new();
                for id in &tried {
                    assert!(seen.insert(id.clone()), "backend id appeared twice in fallback chain");
                }
            }
            other => panic!("expected ExhaustedRetries, got {other:?}"),
        }
    }
}
