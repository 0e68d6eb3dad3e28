//! Trait seams of the analysis pipeline.
//!
//! - StepHandler: one analysis step (usually a reasoning-service call)
//! - SubjectSource: loads the patient context a run analyzes
//! - ResultStore: durable, append-only report persistence
//! - CompletionNotifier: tells someone a run finished

use std::sync::Arc;

use async_trait::async_trait;

use super::error::{AnalysisError, StepError, SubjectError};
use super::payload::{PriorResults, StepPayload};
use super::report::RunReport;
use super::subjects::SubjectContext;
use super::types::{RunRequest, StepName};

/// Everything a step sees: the subject, the request, and prior payloads.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: String,
    pub subject: Arc<SubjectContext>,
    pub request: Arc<RunRequest>,
    pub prior: PriorResults,
    /// 1-based attempt number, set by the executor.
    pub attempt: u32,
}

/// A function from (subject, prior results) to a typed payload or failure.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Which step this handler implements.
    fn step(&self) -> StepName;

    /// Run one attempt. Transient errors are retried by the executor.
    async fn run(&self, ctx: &StepContext) -> Result<StepPayload, StepError>;
}

#[async_trait]
pub trait SubjectSource: Send + Sync {
    async fn load(&self, subject_id: &str) -> Result<SubjectContext, SubjectError>;
}

/// Append-only report persistence.
pub trait ResultStore: Send + Sync {
    /// Persist a report. A second report for the same run fails.
    fn save(&self, report: &RunReport) -> Result<(), AnalysisError>;

    /// Reports for a subject, oldest first.
    fn load_by_subject(&self, subject_id: &str) -> Result<Vec<RunReport>, AnalysisError>;

    fn load_by_run_id(&self, run_id: &str) -> Result<Option<RunReport>, AnalysisError>;

    /// Stored report counts by terminal status.
    fn counts(&self) -> Result<ReportCounts, AnalysisError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReportCounts {
    pub total: u64,
    pub completed: u64,
    pub error: u64,
    pub cancelled: u64,
}

#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    /// Called once per completed run that carries a notification address.
    async fn notify(&self, address: &str, report: &RunReport) -> Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_are_object_safe() {
        fn _handler(_: &dyn StepHandler) {}
        fn _source(_: &dyn SubjectSource) {}
        fn _store(_: &dyn ResultStore) {}
        fn _notifier(_: &dyn CompletionNotifier) {}
    }
}
