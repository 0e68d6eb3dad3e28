//! Mutable state of one run, owned by the orchestrator task driving it.
//!
//! Other components only ever see [`RunSnapshot`]s. Progress is derived from
//! step statuses on every transition, never set by hand.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::graph::ExecutionPlan;
use super::payload::{PriorResults, StepPayload};
use super::types::*;

#[derive(Debug)]
pub struct RunState {
    run_id: String,
    subject_id: String,
    status: RunStatus,
    step_statuses: BTreeMap<StepName, StepStatus>,
    /// Plan order, used for `current_step` and `steps_remaining`.
    order: Vec<StepName>,
    completed: Vec<StepName>,
    results: BTreeMap<StepName, StepPayload>,
    failures: BTreeMap<StepName, StepFailure>,
    progress: u8,
    error: Option<String>,
    cancel_requested: bool,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    sequence: u64,
}

/// What applying a step result means for the run.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEffect {
    Stored,
    /// Optional step failed; run continues.
    Skipped,
    /// Required step failed; run must end in error.
    Fatal(StepFailure),
    Cancelled,
    /// Result arrived after the run went terminal.
    Ignored,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            subject_id: subject_id.into(),
            status: RunStatus::Pending,
            step_statuses: BTreeMap::new(),
            order: Vec::new(),
            completed: Vec::new(),
            results: BTreeMap::new(),
            failures: BTreeMap::new(),
            progress: 0,
            error: None,
            cancel_requested: false,
            created_at: Utc::now(),
            completed_at: None,
            sequence: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn step_statuses(&self) -> &BTreeMap<StepName, StepStatus> {
        &self.step_statuses
    }

    pub fn results(&self) -> &BTreeMap<StepName, StepPayload> {
        &self.results
    }

    pub fn failures(&self) -> &BTreeMap<StepName, StepFailure> {
        &self.failures
    }

    /// `pending → running` with the planned steps all `not_started`.
    pub fn begin(&mut self, plan: &ExecutionPlan) {
        if self.status != RunStatus::Pending {
            return;
        }
        self.order = plan.steps().collect();
        self.step_statuses = self
            .order
            .iter()
            .map(|s| (*s, StepStatus::NotStarted))
            .collect();
        self.status = RunStatus::Running;
        self.recompute_progress();
    }

    pub fn mark_running(&mut self, step: StepName) {
        if self.is_terminal() {
            return;
        }
        if let Some(status) = self.step_statuses.get_mut(&step) {
            if *status == StepStatus::NotStarted {
                *status = StepStatus::Running;
            }
        }
    }

    pub fn mark_cancel_requested(&mut self) {
        if !self.is_terminal() {
            self.cancel_requested = true;
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Fold one finished step into the state.
    pub fn apply(&mut self, result: StepResult, optional: bool) -> StepEffect {
        if self.is_terminal() {
            return StepEffect::Ignored;
        }
        let step = result.step;
        let effect = match result.outcome {
            StepOutcome::Success(payload) => {
                self.results.entry(step).or_insert(payload);
                self.set_status(step, StepStatus::Done);
                if !self.completed.contains(&step) {
                    self.completed.push(step);
                }
                StepEffect::Stored
            }
            StepOutcome::Failed(failure) => {
                self.failures.insert(step, failure.clone());
                if optional {
                    self.set_status(step, StepStatus::Skipped);
                    StepEffect::Skipped
                } else {
                    self.set_status(step, StepStatus::Failed);
                    StepEffect::Fatal(failure)
                }
            }
            StepOutcome::Cancelled => {
                self.set_status(step, StepStatus::NotStarted);
                StepEffect::Cancelled
            }
        };
        self.recompute_progress();
        effect
    }

    /// Terminal transition. Later calls are no-ops.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        if self.is_terminal() || !status.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        if status != RunStatus::Completed {
            for s in self.step_statuses.values_mut() {
                if *s == StepStatus::Running {
                    *s = StepStatus::NotStarted;
                }
            }
        }
        self.recompute_progress();
    }

    fn set_status(&mut self, step: StepName, status: StepStatus) {
        self.step_statuses.insert(step, status);
    }

    /// Never decreases.
    fn recompute_progress(&mut self) {
        let computed = progress_of(&self.step_statuses, self.status);
        self.progress = self.progress.max(computed);
    }

    pub fn current_step(&self) -> Option<StepName> {
        if self.is_terminal() {
            return None;
        }
        self.order
            .iter()
            .copied()
            .find(|s| self.step_statuses.get(s) == Some(&StepStatus::Running))
    }

    pub fn remaining_steps(&self) -> Vec<StepName> {
        self.order
            .iter()
            .copied()
            .filter(|s| {
                matches!(
                    self.step_statuses.get(s),
                    Some(StepStatus::NotStarted | StepStatus::Running)
                )
            })
            .collect()
    }

    /// Immutable view for steps about to be dispatched.
    pub fn prior_results(&self) -> PriorResults {
        PriorResults::new(self.results.clone())
    }

    /// Snapshot with the next sequence number.
    pub fn snapshot(&mut self) -> RunSnapshot {
        self.sequence += 1;
        let current_step = self.current_step();
        RunSnapshot {
            run_id: self.run_id.clone(),
            subject_id: self.subject_id.clone(),
            status: self.status,
            current_step,
            current_step_detail: current_step.map(|s| s.detail_label().to_string()),
            step_statuses: self.step_statuses.clone(),
            steps_completed: self.completed.clone(),
            steps_remaining: if self.is_terminal() {
                Vec::new()
            } else {
                self.remaining_steps()
            },
            progress: self.progress,
            error: self.error.clone(),
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            completed_at: self.completed_at,
            sequence: self.sequence,
        }
    }
}

/// floor(resolved * 100 / total), capped at 99; 100 only when completed.
pub(crate) fn progress_of(statuses: &BTreeMap<StepName, StepStatus>, status: RunStatus) -> u8 {
    if status == RunStatus::Completed {
        return 100;
    }
    if statuses.is_empty() {
        return 0;
    }
    let resolved = statuses.values().filter(|s| s.is_resolved()).count();
    ((resolved * 100 / statuses.len()) as u8).min(99)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::analysis::graph::DependencyGraph;
    use crate::pipeline::analysis::payload::*;
    use std::time::Duration;

    fn ok(step: StepName) -> StepResult {
        let payload = match step {
            StepName::MedicalHistory => StepPayload::MedicalHistory(Default::default()),
            StepName::Genomics => StepPayload::Genomics(Default::default()),
            StepName::ClinicalTrials => StepPayload::ClinicalTrials(Default::default()),
            StepName::Evidence => StepPayload::Evidence(Default::default()),
            StepName::Treatment => StepPayload::Treatment(Default::default()),
            StepName::Synthesis => StepPayload::Synthesis(Default::default()),
        };
        StepResult {
            step,
            outcome: StepOutcome::Success(payload),
            duration: Duration::from_millis(5),
            retries: 0,
        }
    }

    fn started(optional: &[StepName]) -> RunState {
        let plan = DependencyGraph::standard().unwrap().plan(optional);
        let mut state = RunState::new("run-1", "patient-1");
        state.begin(&plan);
        state
    }

    #[test]
    fn begin_marks_all_not_started() {
        let state = started(&[StepName::ClinicalTrials]);
        assert_eq!(state.status(), RunStatus::Running);
        assert_eq!(state.step_statuses().len(), 5);
        assert!(state
            .step_statuses()
            .values()
            .all(|s| *s == StepStatus::NotStarted));
        assert_eq!(state.progress(), 0);
    }

    #[test]
    fn progress_is_floor_of_resolved_fraction() {
        let mut state = started(&[StepName::ClinicalTrials, StepName::Evidence]);
        state.apply(ok(StepName::MedicalHistory), false);
        assert_eq!(state.progress(), 16); // 1/6
        state.apply(ok(StepName::Genomics), false);
        assert_eq!(state.progress(), 33); // 2/6
    }

    #[test]
    fn progress_of_counts_skipped_and_failed_as_resolved() {
        let statuses: BTreeMap<StepName, StepStatus> = [
            (StepName::MedicalHistory, StepStatus::Done),
            (StepName::Genomics, StepStatus::Failed),
            (StepName::Evidence, StepStatus::Skipped),
            (StepName::Treatment, StepStatus::Running),
        ]
        .into_iter()
        .collect();
        assert_eq!(progress_of(&statuses, RunStatus::Running), 75);
        assert_eq!(progress_of(&statuses, RunStatus::Completed), 100);
        assert_eq!(progress_of(&BTreeMap::new(), RunStatus::Error), 0);
    }

    #[test]
    fn progress_caps_at_99_until_completed() {
        let mut state = started(&[]);
        for step in [
            StepName::MedicalHistory,
            StepName::Genomics,
            StepName::Treatment,
            StepName::Synthesis,
        ] {
            state.apply(ok(step), false);
        }
        assert_eq!(state.progress(), 99);
        state.finish(RunStatus::Completed, None);
        assert_eq!(state.progress(), 100);
    }

    #[test]
    fn optional_failure_becomes_skipped_and_counts() {
        let mut state = started(&[StepName::Evidence]);
        state.apply(ok(StepName::MedicalHistory), false);
        let effect = state.apply(
            StepResult::failed(StepName::Evidence, FailureKind::Transient, "503"),
            true,
        );
        assert_eq!(effect, StepEffect::Skipped);
        assert_eq!(state.step_statuses()[&StepName::Evidence], StepStatus::Skipped);
        assert_eq!(state.progress(), 40); // 2/5
        assert!(!state.results().contains_key(&StepName::Evidence));
    }

    #[test]
    fn required_failure_is_fatal() {
        let mut state = started(&[]);
        let effect = state.apply(
            StepResult::failed(StepName::MedicalHistory, FailureKind::Timeout, "30s"),
            false,
        );
        assert!(matches!(effect, StepEffect::Fatal(f) if f.kind == FailureKind::Timeout));
        assert_eq!(
            state.step_statuses()[&StepName::MedicalHistory],
            StepStatus::Failed
        );
        assert_eq!(state.progress(), 0);
    }

    #[test]
    fn cancelled_step_reverts_to_not_started() {
        let mut state = started(&[]);
        state.mark_running(StepName::MedicalHistory);
        let effect = state.apply(
            StepResult {
                step: StepName::MedicalHistory,
                outcome: StepOutcome::Cancelled,
                duration: Duration::ZERO,
                retries: 0,
            },
            false,
        );
        assert_eq!(effect, StepEffect::Cancelled);
        assert_eq!(
            state.step_statuses()[&StepName::MedicalHistory],
            StepStatus::NotStarted
        );
    }

    #[test]
    fn terminal_state_is_frozen() {
        let mut state = started(&[]);
        state.apply(ok(StepName::MedicalHistory), false);
        state.finish(RunStatus::Cancelled, None);
        let progress = state.progress();
        assert_eq!(state.apply(ok(StepName::Genomics), false), StepEffect::Ignored);
        state.finish(RunStatus::Completed, None);
        assert_eq!(state.status(), RunStatus::Cancelled);
        assert_eq!(state.progress(), progress);
        assert!(state.completed_at().is_some());
    }

    #[test]
    fn snapshot_sequence_increases_and_tracks_current_step() {
        let mut state = started(&[StepName::ClinicalTrials]);
        state.apply(ok(StepName::MedicalHistory), false);
        state.mark_running(StepName::ClinicalTrials);
        state.mark_running(StepName::Genomics);
        let first = state.snapshot();
        let second = state.snapshot();
        assert!(second.sequence > first.sequence);
        assert_eq!(first.current_step, Some(StepName::Genomics));
        assert_eq!(
            first.current_step_detail.as_deref(),
            Some("Interpreting genomic data...")
        );
        assert_eq!(first.steps_completed, vec![StepName::MedicalHistory]);
        assert_eq!(first.steps_remaining.len(), 4);
    }

    #[test]
    fn pending_state_snapshot_has_no_steps() {
        let mut state = RunState::new("r", "p");
        let snap = state.snapshot();
        assert_eq!(snap.status, RunStatus::Pending);
        assert!(snap.step_statuses.is_empty());
        assert_eq!(snap.progress, 0);
    }

    #[test]
    fn error_without_steps_from_pending() {
        let mut state = RunState::new("r", "p");
        state.finish(RunStatus::Error, Some("Patient not found: p".into()));
        let snap = state.snapshot();
        assert_eq!(snap.status, RunStatus::Error);
        assert_eq!(snap.progress, 0);
        assert_eq!(snap.error.as_deref(), Some("Patient not found: p"));
    }
}
