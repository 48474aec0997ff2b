//! Parallel Fan-Out & Synthesizer.
//!
//! Concurrency bounded by a `tokio::sync::Semaphore`; each child runs
//! inside its own spawned task collected via a `JoinSet`, so one hung
//! child cannot block its siblings. Results are re-sorted back into input
//! order before return.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;
use crate::fallback::FallbackOrchestrator;
use crate::model::{BackendId, CanonicalRequest, ProgressChunk, ProgressSink};

/// Default concurrency cap when the caller doesn't specify one.
pub const DEFAULT_MAX_PARALLEL: usize = 3;

#[derive(Debug, Clone)]
pub struct BackendOutcome {
    pub id: BackendId,
    pub result: Result<String, String>,
}

#[derive(Debug, Clone)]
pub struct FanOutResult {
    /// Preserves the input `backends` order regardless of completion order.
    pub outcomes: Vec<BackendOutcome>,
}

impl FanOutResult {
    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }
}

/// `run_parallel(backends, promptBuilder, optionsBuilder, onProgress)`.
pub async fn run_parallel(
    orchestrator: Arc<FallbackOrchestrator>,
    backends: Vec<BackendId>,
    request_builder: impl Fn(&BackendId) -> CanonicalRequest + Send + Sync + 'static,
    on_progress: Option<ProgressSink>,
    max_parallel: Option<usize>,
    cancel: CancellationToken,
) -> Result<FanOutResult, OrchestratorError> {
    let bound = max_parallel.unwrap_or(DEFAULT_MAX_PARALLEL).min(backends.len().max(1));
    let semaphore = Arc::new(Semaphore::new(bound));
    let request_builder = Arc::new(request_builder);

    let mut joinset: JoinSet<(usize, BackendId, Result<String, String>)> = JoinSet::new();

    for (index, id) in backends.iter().cloned().enumerate() {
        let semaphore = semaphore.clone();
        let orchestrator = orchestrator.clone();
        let request_builder = request_builder.clone();
        let on_progress = on_progress.clone();
        let cancel = cancel.clone();

        joinset.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");

            let mut request = request_builder(&id);
            request.backend_id = Some(id.clone());

            if let Some(sink) = on_progress {
                let tag = format!("[{id}] ");
                let tagged: ProgressSink = Arc::new(move |mut chunk: ProgressChunk| {
                    chunk.tag = format!("{tag}{}", chunk.tag);
                    sink(chunk);
                });
                request.progress_sink = Some(tagged);
            }

            if cancel.is_cancelled() {
                return (index, id, Err(OrchestratorError::Cancelled.to_string()));
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(OrchestratorError::Cancelled.to_string()),
                outcome = orchestrator.execute(request, cancel.clone()) => outcome.map_err(|e| e.to_string()),
            };

            (index, id, result)
        });
    }

    let mut slots: Vec<Option<BackendOutcome>> = (0..backends.len()).map(|_| None).collect();
    while let Some(joined) = joinset.join_next().await {
        let (index, id, result) = joined.map_err(|err| {
            OrchestratorError::Other(anyhow::anyhow!("fan-out task panicked: {err}"))
        })?;
        slots[index] = Some(BackendOutcome { id, result });
    }

    let outcomes: Vec<BackendOutcome> = slots.into_iter().map(|s| s.expect("every index populated")).collect();

    if outcomes.iter().all(|o| o.result.is_err()) && !outcomes.is_empty() {
        let errors = outcomes
            .iter()
            .map(|o| (o.id.clone(), o.result.clone().unwrap_err()))
            .collect::<std::collections::BTreeMap<_, _>>();
        return Err(OrchestratorError::AllBackendsFailed(errors));
    }

    Ok(FanOutResult { outcomes })
}
