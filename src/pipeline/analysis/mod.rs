//! Analysis orchestration engine
//!
//! Runs the multi-step oncology analysis for one patient: steps execute in
//! dependency waves, progress streams to any number of subscribers, the run
//! can be cancelled mid-flight, and the final report is persisted whether or
//! not anyone was listening.
//!
//! ```text
//! AnalysisService → Orchestrator → StepExecutor → StepHandler (steps/*)
//!                        │
//!                        ├─ RunRegistry        (one active run per patient)
//!                        ├─ ProgressBroadcaster (per-run watch channels)
//!                        └─ ResultStore        (append-only SQLite)
//! ```
//!
//! Step waves for the standard graph:
//! 1. medical_history
//! 2. genomics, clinical_trials (optional), evidence (optional)
//! 3. treatment
//! 4. synthesis

pub mod error;
pub mod types;
pub mod payload;
pub mod traits;
pub mod subjects;
pub mod graph;
pub mod state;
pub mod report;
pub mod executor;
pub mod registry;
pub mod broadcast;
pub mod store;
pub mod notify;
pub mod orchestrator;
pub mod service;
pub mod steps;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AnalysisError, GraphError, StepError, SubjectError};
pub use types::*;
pub use payload::*;
pub use traits::*;
pub use subjects::{InMemorySubjectSource, JsonFileSubjectSource, SubjectContext};
pub use graph::{DependencyGraph, ExecutionPlan, StepDefinition};
pub use report::RunReport;
pub use executor::{RetryPolicy, StepExecutor};
pub use registry::{CancelOutcome, RunFilter, RunRegistry};
pub use broadcast::{ProgressBroadcaster, SnapshotStream};
pub use store::SqliteResultStore;
pub use notify::{LogNotifier, RecordingNotifier};
pub use orchestrator::{EngineParts, EngineSettings, Orchestrator};
pub use service::{AnalysisService, EngineStats, SweeperHandle};
pub use steps::standard_handlers;
