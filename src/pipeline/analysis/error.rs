//! Error types for the analysis pipeline.
//!
//! Four layers: configuration ([`GraphError`], fatal at startup), subject
//! loading ([`SubjectError`], run ends with zero steps), step execution
//! ([`StepError`], retried or surfaced as a failed step), and the service
//! facade ([`AnalysisError`]).

use thiserror::Error;

use super::types::StepName;
use crate::db::DatabaseError;
use crate::pipeline::reasoning::ReasoningError;

/// Invalid step graph or handler wiring. Detected when the engine is built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Step defined twice: {0}")]
    DuplicateStep(StepName),

    #[error("Step {step} depends on undefined step {missing}")]
    MissingDependency { step: StepName, missing: StepName },

    #[error("Dependency cycle involving: {0:?}")]
    Cycle(Vec<StepName>),

    #[error("More than one terminal step: {0} and {1}")]
    MultipleTerminal(StepName, StepName),

    #[error("Terminal step {0} cannot be optional")]
    OptionalTerminal(StepName),

    #[error("No handler registered for step {0}")]
    MissingHandler(StepName),

    #[error("Handler registered twice for step {0}")]
    DuplicateHandler(StepName),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubjectError {
    #[error("Patient not found: {0}")]
    NotFound(String),

    #[error("Invalid patient id: {0}")]
    InvalidId(String),

    #[error("Patient record unreadable: {0}")]
    Invalid(String),
}

/// Failure raised by a step handler for one attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error(transparent)]
    Reasoning(#[from] ReasoningError),

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),

    #[error("Invalid patient context: {0}")]
    InvalidSubject(String),

    #[error("Missing required result from step {0}")]
    MissingPriorResult(StepName),

    #[error("Internal step error: {0}")]
    Internal(String),
}

impl StepError {
    /// Transient failures are retried by the executor; the rest fail at once.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Reasoning(e) => e.is_transient(),
            Self::MalformedResponse(_) => true,
            Self::InvalidSubject(_) | Self::MissingPriorResult(_) | Self::Internal(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Configuration error: {0}")]
    Config(#[from] GraphError),

    #[error("Analysis {run_id} already running for patient {subject_id}")]
    Conflict { subject_id: String, run_id: String },

    #[error("Analysis run not found: {0}")]
    RunNotFound(String),

    #[error("Analysis {0} has not finished yet")]
    NotFinished(String),

    #[error("A report for run {0} already exists")]
    DuplicateReport(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("JSON parsing error: {0}")]
    JsonParsing(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_not_transient() {
        assert!(!StepError::InvalidSubject("no cancer details".into()).is_transient());
        assert!(!StepError::MissingPriorResult(StepName::MedicalHistory).is_transient());
        assert!(!StepError::Reasoning(ReasoningError::Rejected {
            status: 400,
            body: String::new()
        })
        .is_transient());
    }

    #[test]
    fn network_and_malformed_output_transient() {
        assert!(StepError::Reasoning(ReasoningError::RateLimited).is_transient());
        assert!(StepError::MalformedResponse("missing field".into()).is_transient());
    }

    #[test]
    fn conflict_message_names_run() {
        let err = AnalysisError::Conflict {
            subject_id: "p1".into(),
            run_id: "r9".into(),
        };
        assert_eq!(err.to_string(), "Analysis r9 already running for patient p1");
    }

    #[test]
    fn graph_error_display() {
        let err = GraphError::MissingDependency {
            step: StepName::Treatment,
            missing: StepName::Evidence,
        };
        assert_eq!(err.to_string(), "Step treatment depends on undefined step evidence");
    }
}
