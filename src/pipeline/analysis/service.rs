//! In-process facade over the engine: start, observe, cancel, fetch results.
//!
//! Reads fall back from the live registry to the result store, so a run stays
//! observable after it has been evicted from memory.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::broadcast::SnapshotStream;
use super::error::AnalysisError;
use super::orchestrator::{EngineParts, Orchestrator};
use super::registry::{CancelOutcome, RunFilter};
use super::report::RunReport;
use super::traits::{ReportCounts, ResultStore};
use super::types::{RunRequest, RunSnapshot};

/// Engine-wide counters for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub active_runs: usize,
    pub tracked_runs: usize,
    pub reports: ReportCounts,
}

#[derive(Clone)]
pub struct AnalysisService {
    orchestrator: Orchestrator,
    parts: EngineParts,
}

impl AnalysisService {
    pub fn new(orchestrator: Orchestrator, parts: EngineParts) -> Self {
        Self {
            orchestrator,
            parts,
        }
    }

    /// Start a run. Fails with `Conflict` while the subject has an active run.
    pub fn start(&self, request: RunRequest) -> Result<RunSnapshot, AnalysisError> {
        self.orchestrator.start(request)
    }

    /// Latest snapshot: live from the registry, else rebuilt from the store.
    pub async fn status(&self, run_id: &str) -> Result<RunSnapshot, AnalysisError> {
        if let Some(snapshot) = self.parts.registry.get(run_id) {
            return Ok(snapshot);
        }
        self.stored_report(run_id).await.map(|r| r.to_snapshot())
    }

    /// Snapshot stream for a run. A live run yields catch-up plus updates; a
    /// finished run yields its terminal snapshot once.
    pub async fn stream(&self, run_id: &str) -> Result<SnapshotStream, AnalysisError> {
        if let Some(stream) = self.parts.broadcaster.subscribe(run_id) {
            return Ok(stream);
        }
        let last = self.status(run_id).await?;
        Ok(Box::pin(tokio_stream::once(last)))
    }

    pub fn active_for_subject(&self, subject_id: &str) -> Option<RunSnapshot> {
        self.parts.registry.find_active_by_subject(subject_id)
    }

    /// Runs still tracked in memory for a subject, oldest first.
    pub fn runs_for_subject(&self, subject_id: &str) -> Vec<RunSnapshot> {
        self.parts.registry.list(&RunFilter {
            subject_id: Some(subject_id.to_string()),
            ..Default::default()
        })
    }

    /// Request cancellation. Idempotent; a run already persisted counts as
    /// terminal even after eviction.
    pub async fn cancel(&self, run_id: &str) -> Result<CancelOutcome, AnalysisError> {
        match self.parts.registry.request_cancel(run_id) {
            Err(AnalysisError::RunNotFound(_)) => {
                self.stored_report(run_id).await?;
                Ok(CancelOutcome::AlreadyTerminal)
            }
            other => other,
        }
    }

    /// Final report of a finished run.
    pub async fn report(&self, run_id: &str) -> Result<RunReport, AnalysisError> {
        if let Some(snapshot) = self.parts.registry.get(run_id) {
            if !snapshot.is_terminal() {
                return Err(AnalysisError::NotFinished(run_id.to_string()));
            }
        }
        self.stored_report(run_id).await
    }

    /// Reports for a subject, newest first, at most `limit` of them.
    pub async fn history(
        &self,
        subject_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<RunReport>, AnalysisError> {
        let subject_id = subject_id.to_string();
        let mut reports = self
            .with_store(move |store| store.load_by_subject(&subject_id))
            .await?;
        reports.reverse();
        if let Some(limit) = limit {
            reports.truncate(limit);
        }
        Ok(reports)
    }

    pub async fn stats(&self) -> Result<EngineStats, AnalysisError> {
        let reports = self.with_store(|store| store.counts()).await?;
        Ok(EngineStats {
            active_runs: self.parts.registry.active_count(),
            tracked_runs: self.parts.registry.list(&RunFilter::default()).len(),
            reports,
        })
    }

    /// Periodically evict expired terminal runs from the registry.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let registry = self.parts.registry.clone();

        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Run registry sweeper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.evict_expired(std::time::Instant::now());
                    }
                }
            }
            tracing::info!("Run registry sweeper shutting down");
        });

        SweeperHandle {
            shutdown,
            handle: Some(handle),
        }
    }

    async fn stored_report(&self, run_id: &str) -> Result<RunReport, AnalysisError> {
        let id = run_id.to_string();
        self.with_store(move |store| store.load_by_run_id(&id))
            .await?
            .ok_or_else(|| AnalysisError::RunNotFound(run_id.to_string()))
    }

    /// Run a store call on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> Result<T, AnalysisError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ResultStore) -> Result<T, AnalysisError> + Send + 'static,
    {
        let store = self.parts.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| AnalysisError::Internal(format!("store task failed: {e}")))?
    }
}

/// Handle for the registry sweeper task.
///
/// Stops the task on `shutdown()` or when dropped.
pub struct SweeperHandle {
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop the task and wait for it to exit.
    pub async fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
