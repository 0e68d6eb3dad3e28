//! Process-wide table of in-flight and recently finished runs.
//!
//! At most one non-terminal run per subject. Critical sections are short and
//! never span an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::error::AnalysisError;
use super::types::{RunSnapshot, RunStatus};

#[derive(Debug)]
struct RunEntry {
    snapshot: RunSnapshot,
    cancel: CancellationToken,
    terminal_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    runs: HashMap<String, RunEntry>,
    /// subject id → run id of its non-terminal run
    active_by_subject: HashMap<String, String>,
}

/// Outcome of a cancel request. Every variant is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Requested,
    AlreadyRequested,
    AlreadyTerminal,
}

/// Selection for [`RunRegistry::list`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub subject_id: Option<String>,
    pub status: Option<RunStatus>,
    pub active_only: bool,
}

impl RunFilter {
    fn matches(&self, snapshot: &RunSnapshot) -> bool {
        self.subject_id
            .as_deref()
            .map_or(true, |s| s == snapshot.subject_id)
            && self.status.map_or(true, |s| s == snapshot.status)
            && (!self.active_only || !snapshot.is_terminal())
    }
}

#[derive(Debug)]
pub struct RunRegistry {
    inner: Mutex<RegistryInner>,
    retention: Duration,
}

impl RunRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a new run. Fails with `Conflict` if the subject already has a
    /// non-terminal run; check and insert happen under one lock.
    pub fn register(
        &self,
        snapshot: RunSnapshot,
        cancel: CancellationToken,
    ) -> Result<(), AnalysisError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.active_by_subject.get(&snapshot.subject_id) {
            return Err(AnalysisError::Conflict {
                subject_id: snapshot.subject_id.clone(),
                run_id: existing.clone(),
            });
        }
        let terminal = snapshot.is_terminal();
        if !terminal {
            inner
                .active_by_subject
                .insert(snapshot.subject_id.clone(), snapshot.run_id.clone());
        }
        inner.runs.insert(
            snapshot.run_id.clone(),
            RunEntry {
                snapshot,
                cancel,
                terminal_at: terminal.then(Instant::now),
            },
        );
        Ok(())
    }

    /// Record the latest snapshot of a run. Terminal snapshots free the
    /// subject slot and start the retention clock. Updates to a run that is
    /// already terminal are dropped.
    pub fn update(&self, mut snapshot: RunSnapshot) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let Some(entry) = inner.runs.get_mut(&snapshot.run_id) else {
            tracing::debug!(run_id = %snapshot.run_id, "Update for unknown run ignored");
            return;
        };
        if entry.snapshot.is_terminal() {
            return;
        }
        if !snapshot.is_terminal() && entry.cancel.is_cancelled() {
            snapshot.cancel_requested = true;
        }
        if snapshot.is_terminal() {
            entry.terminal_at = Some(Instant::now());
            if inner.active_by_subject.get(&snapshot.subject_id) == Some(&snapshot.run_id) {
                inner.active_by_subject.remove(&snapshot.subject_id);
            }
        }
        entry.snapshot = snapshot;
    }

    pub fn get(&self, run_id: &str) -> Option<RunSnapshot> {
        self.lock().runs.get(run_id).map(|e| e.snapshot.clone())
    }

    pub fn find_active_by_subject(&self, subject_id: &str) -> Option<RunSnapshot> {
        let inner = self.lock();
        let run_id = inner.active_by_subject.get(subject_id)?;
        inner.runs.get(run_id).map(|e| e.snapshot.clone())
    }

    /// Trigger the run's cancellation token and return at once. Idempotent.
    pub fn request_cancel(&self, run_id: &str) -> Result<CancelOutcome, AnalysisError> {
        let mut inner = self.lock();
        let entry = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| AnalysisError::RunNotFound(run_id.to_string()))?;
        if entry.snapshot.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        if entry.cancel.is_cancelled() {
            return Ok(CancelOutcome::AlreadyRequested);
        }
        entry.cancel.cancel();
        entry.snapshot.cancel_requested = true;
        tracing::info!(run_id, subject_id = %entry.snapshot.subject_id, "Cancellation requested");
        Ok(CancelOutcome::Requested)
    }

    /// Matching runs, oldest first.
    pub fn list(&self, filter: &RunFilter) -> Vec<RunSnapshot> {
        let inner = self.lock();
        let mut runs: Vec<RunSnapshot> = inner
            .runs
            .values()
            .map(|e| &e.snapshot)
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.run_id.cmp(&b.run_id)));
        runs
    }

    pub fn active_count(&self) -> usize {
        self.lock().active_by_subject.len()
    }

    /// Drop terminal runs whose retention window ended before `now`.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let before = inner.runs.len();
        let retention = self.retention;
        inner.runs.retain(|_, entry| match entry.terminal_at {
            Some(at) => now.saturating_duration_since(at) < retention,
            None => true,
        });
        let evicted = before - inner.runs.len();
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted expired runs from registry");
        }
        evicted
    }
}
