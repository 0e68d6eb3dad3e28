//! Drives one run through the step graph.
//!
//! State machine: `pending → running → {completed | error | cancelled}`.
//! Each run is one tokio task that exclusively owns its [`RunState`]. Steps of
//! a wave run as separate tasks and are joined before the next wave starts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::broadcast::ProgressBroadcaster;
use super::error::{AnalysisError, GraphError};
use super::executor::{panic_message, RetryPolicy, StepExecutor};
use super::graph::{DependencyGraph, ExecutionPlan};
use super::registry::RunRegistry;
use super::report::RunReport;
use super::state::{RunState, StepEffect};
use super::subjects::SubjectContext;
use super::traits::{CompletionNotifier, ResultStore, StepContext, StepHandler, SubjectSource};
use super::types::*;

/// Timing knobs for the engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub step_timeout: Duration,
    pub run_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            step_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(600),
        }
    }
}

/// Collaborators shared between the orchestrator and the service facade.
#[derive(Clone)]
pub struct EngineParts {
    pub registry: Arc<RunRegistry>,
    pub broadcaster: Arc<ProgressBroadcaster>,
    pub store: Arc<dyn ResultStore>,
    pub subjects: Arc<dyn SubjectSource>,
    pub notifier: Arc<dyn CompletionNotifier>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    graph: DependencyGraph,
    executor: StepExecutor,
    parts: EngineParts,
    run_timeout: Duration,
}

/// How the wave loop ended.
enum WaveOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl Orchestrator {
    /// Fails if any graph step lacks a handler.
    pub fn new(
        graph: DependencyGraph,
        handlers: Vec<Arc<dyn StepHandler>>,
        settings: EngineSettings,
        parts: EngineParts,
    ) -> Result<Self, GraphError> {
        let executor = StepExecutor::new(&graph, handlers, settings.retry, settings.step_timeout)?;
        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                graph,
                executor,
                parts,
                run_timeout: settings.run_timeout,
            }),
        })
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.inner.graph
    }

    /// Register a new run and spawn its driver task.
    ///
    /// Returns the pending snapshot at once; fails fast with `Conflict` when
    /// the subject already has a non-terminal run.
    pub fn start(&self, request: RunRequest) -> Result<RunSnapshot, AnalysisError> {
        let parts = &self.inner.parts;
        let run_id = Uuid::new_v4().to_string();
        let mut state = RunState::new(&run_id, &request.subject_id);
        let snapshot = state.snapshot();
        let cancel = CancellationToken::new();

        // Channel first so a subscriber arriving right after registration
        // finds it.
        parts.broadcaster.open(snapshot.clone());
        if let Err(e) = parts.registry.register(snapshot.clone(), cancel.clone()) {
            parts.broadcaster.close(&run_id);
            tracing::info!(subject_id = %request.subject_id, error = %e, "Analysis start rejected");
            return Err(e);
        }

        tracing::info!(
            run_id = %run_id,
            subject_id = %request.subject_id,
            include_trials = request.features.include_trials,
            include_evidence = request.features.include_evidence,
            "Analysis started"
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.drive(state, Arc::new(request), cancel).await;
        });
        Ok(snapshot)
    }

    async fn drive(&self, mut state: RunState, request: Arc<RunRequest>, cancel: CancellationToken) {
        let subject = match self.inner.parts.subjects.load(&request.subject_id).await {
            Ok(subject) => Arc::new(subject),
            Err(e) => {
                tracing::warn!(
                    run_id = %state.run_id(),
                    subject_id = %request.subject_id,
                    error = %e,
                    "Patient context could not be loaded"
                );
                state.finish(RunStatus::Error, Some(e.to_string()));
                self.finalize(&mut state, None, &request).await;
                return;
            }
        };

        let plan = self
            .inner
            .graph
            .plan(&request.features.enabled_optional_steps());
        state.begin(&plan);
        self.publish(&mut state);

        let outcome = self
            .run_waves(&mut state, &plan, &subject, &request, &cancel)
            .await;
        match outcome {
            WaveOutcome::Completed => state.finish(RunStatus::Completed, None),
            WaveOutcome::Cancelled => state.finish(RunStatus::Cancelled, None),
            WaveOutcome::Failed(message) => state.finish(RunStatus::Error, Some(message)),
        }
        self.finalize(&mut state, Some(&subject), &request).await;
    }

    async fn run_waves(
        &self,
        state: &mut RunState,
        plan: &ExecutionPlan,
        subject: &Arc<SubjectContext>,
        request: &Arc<RunRequest>,
        cancel: &CancellationToken,
    ) -> WaveOutcome {
        let deadline = Instant::now() + self.inner.run_timeout;

        for (index, wave) in plan.waves().iter().enumerate() {
            if cancel.is_cancelled() {
                return WaveOutcome::Cancelled;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    run_id = %state.run_id(),
                    wave = index,
                    "Run exceeded its time limit before dispatch"
                );
                return WaveOutcome::Failed(self.time_limit_message());
            }

            let prior = state.prior_results();
            let mut tasks = FuturesUnordered::new();
            let mut in_flight = Vec::with_capacity(wave.len());
            for &step in wave {
                state.mark_running(step);
                let ctx = StepContext {
                    run_id: state.run_id().to_string(),
                    subject: subject.clone(),
                    request: request.clone(),
                    prior: prior.clone(),
                    attempt: 0,
                };
                let this = self.clone();
                let token = cancel.clone();
                let handle = tokio::spawn(async move {
                    this.inner.executor.execute(step, ctx, &token).await
                });
                in_flight.push((step, handle.abort_handle()));
                tasks.push(async move { (step, handle.await) });
            }
            tracing::debug!(run_id = %state.run_id(), wave = index, steps = ?wave, "Wave dispatched");
            self.publish(state);

            let mut pending: HashSet<StepName> = wave.iter().copied().collect();
            let mut fatal: Option<String> = None;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        tracing::warn!(
                            run_id = %state.run_id(),
                            wave = index,
                            in_flight = ?pending,
                            "Run exceeded its time limit"
                        );
                        for (step, abort) in &in_flight {
                            if pending.contains(step) {
                                abort.abort();
                                state.apply(
                                    StepResult::failed(
                                        *step,
                                        FailureKind::Timeout,
                                        "aborted at run time limit",
                                    ),
                                    false,
                                );
                            }
                        }
                        return WaveOutcome::Failed(self.time_limit_message());
                    }
                    _ = cancel.cancelled(), if !state.cancel_requested() => {
                        state.mark_cancel_requested();
                        self.publish(state);
                    }
                    next = tasks.next() => {
                        let Some((step, joined)) = next else { break };
                        pending.remove(&step);
                        let result = step_result_from_join(step, joined);
                        tracing::info!(
                            run_id = %state.run_id(),
                            step = %step,
                            success = result.is_success(),
                            retries = result.retries,
                            duration_ms = result.duration.as_millis() as u64,
                            "Step finished"
                        );
                        if let StepEffect::Fatal(failure) = state.apply(result, plan.is_optional(step)) {
                            fatal.get_or_insert(failure.to_string());
                        }
                        self.publish(state);
                    }
                }
            }

            if cancel.is_cancelled() {
                return WaveOutcome::Cancelled;
            }
            if let Some(message) = fatal {
                return WaveOutcome::Failed(message);
            }
        }

        WaveOutcome::Completed
    }

    /// Persist, record, publish, close, notify. Runs exactly once per run.
    async fn finalize(
        &self,
        state: &mut RunState,
        subject: Option<&SubjectContext>,
        request: &RunRequest,
    ) {
        let parts = &self.inner.parts;
        let report = RunReport::build(state, subject);

        let store = parts.store.clone();
        let to_save = report.clone();
        match tokio::task::spawn_blocking(move || store.save(&to_save)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(run_id = %report.run_id, error = %e, "Failed to persist analysis report")
            }
            Err(e) => {
                tracing::error!(run_id = %report.run_id, error = %e, "Report persistence task failed")
            }
        }

        let snapshot = state.snapshot();
        parts.registry.update(snapshot.clone());
        parts.broadcaster.publish(snapshot);
        parts.broadcaster.close(state.run_id());

        tracing::info!(
            run_id = %report.run_id,
            subject_id = %report.subject_id,
            status = %report.status,
            progress = state.progress(),
            "Analysis finished"
        );

        if report.status == RunStatus::Completed {
            if let Some(address) = request.notify_address.as_deref() {
                if let Err(e) = parts.notifier.notify(address, &report).await {
                    tracing::warn!(run_id = %report.run_id, error = %e, "Completion notification failed");
                }
            }
        }
    }

    fn time_limit_message(&self) -> String {
        format!(
            "timeout: analysis exceeded {}s",
            self.inner.run_timeout.as_secs()
        )
    }

    fn publish(&self, state: &mut RunState) {
        let snapshot = state.snapshot();
        self.inner.parts.registry.update(snapshot.clone());
        self.inner.parts.broadcaster.publish(snapshot);
    }
}

/// A step task that died (panic or abort) becomes an internal failure.
fn step_result_from_join(step: StepName, joined: Result<StepResult, JoinError>) -> StepResult {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(&*e.into_panic());
            StepResult::failed(step, FailureKind::Internal, message)
        }
        Err(e) => StepResult::failed(step, FailureKind::Internal, e.to_string()),
    }
}
