//! Core types for the analysis pipeline.
//!
//! Lifecycle: RunRequest → RunState (published as RunSnapshot) → RunReport.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::StepPayload;

// ═══════════════════════════════════════════
// Step names
// ═══════════════════════════════════════════

/// Canonical step names. Declaration order is the canonical pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    MedicalHistory,
    Genomics,
    ClinicalTrials,
    Evidence,
    Treatment,
    Synthesis,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MedicalHistory => "medical_history",
            Self::Genomics => "genomics",
            Self::ClinicalTrials => "clinical_trials",
            Self::Evidence => "evidence",
            Self::Treatment => "treatment",
            Self::Synthesis => "synthesis",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "medical_history" => Some(Self::MedicalHistory),
            "genomics" => Some(Self::Genomics),
            "clinical_trials" => Some(Self::ClinicalTrials),
            "evidence" => Some(Self::Evidence),
            "treatment" => Some(Self::Treatment),
            "synthesis" => Some(Self::Synthesis),
            _ => None,
        }
    }

    pub fn all() -> &'static [StepName] {
        &[
            Self::MedicalHistory,
            Self::Genomics,
            Self::ClinicalTrials,
            Self::Evidence,
            Self::Treatment,
            Self::Synthesis,
        ]
    }

    /// Display label shown while the step is running.
    pub fn detail_label(&self) -> &'static str {
        match self {
            Self::MedicalHistory => "Analyzing medical history...",
            Self::Genomics => "Interpreting genomic data...",
            Self::ClinicalTrials => "Matching to clinical trials...",
            Self::Evidence => "Searching medical literature...",
            Self::Treatment => "Generating treatment recommendations...",
            Self::Synthesis => "Synthesizing final report...",
        }
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════
// Statuses
// ═══════════════════════════════════════════

/// Run lifecycle: pending → running → {completed | error | cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    Running,
    Done,
    Skipped,
    Failed,
}

impl StepStatus {
    /// Done or skipped: counts toward progress.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }
}

// ═══════════════════════════════════════════
// Run request (immutable input)
// ═══════════════════════════════════════════

/// Flags selecting the optional steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub include_trials: bool,
    pub include_evidence: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            include_trials: true,
            include_evidence: true,
        }
    }
}

impl FeatureFlags {
    /// Optional steps these flags turn on.
    pub fn enabled_optional_steps(&self) -> Vec<StepName> {
        let mut steps = Vec::new();
        if self.include_trials {
            steps.push(StepName::ClinicalTrials);
        }
        if self.include_evidence {
            steps.push(StepName::Evidence);
        }
        steps
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub subject_id: String,
    pub features: FeatureFlags,
    /// Supplementary questions forwarded to the literature step.
    pub questions: Vec<String>,
    pub notify_address: Option<String>,
}

impl RunRequest {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            features: FeatureFlags::default(),
            questions: Vec::new(),
            notify_address: None,
        }
    }

    pub fn with_features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    pub fn with_questions(mut self, questions: Vec<String>) -> Self {
        self.questions = questions;
        self
    }

    pub fn with_notify_address(mut self, address: Option<String>) -> Self {
        self.notify_address = address;
        self
    }
}

// ═══════════════════════════════════════════
// Step results
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Per-step or run-level deadline hit.
    Timeout,
    /// Retries exhausted on a transient class.
    Transient,
    /// Malformed input or missing prior result. Never retried.
    Validation,
    /// Panic or unexpected handler state.
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::Validation => "validation",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(StepPayload),
    Failed(StepFailure),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step: StepName,
    pub outcome: StepOutcome,
    pub duration: Duration,
    /// Attempts beyond the first.
    pub retries: u32,
}

impl StepResult {
    pub fn failed(step: StepName, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            step,
            outcome: StepOutcome::Failed(StepFailure {
                kind,
                message: message.into(),
            }),
            duration: Duration::ZERO,
            retries: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StepOutcome::Success(_))
    }
}

// ═══════════════════════════════════════════
// Snapshot (read-only view of RunState)
// ═══════════════════════════════════════════

/// Immutable view of a run, as published to subscribers and the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub subject_id: String,
    pub status: RunStatus,
    pub current_step: Option<StepName>,
    pub current_step_detail: Option<String>,
    pub step_statuses: BTreeMap<StepName, StepStatus>,
    pub steps_completed: Vec<StepName>,
    pub steps_remaining: Vec<StepName>,
    pub progress: u8,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Strictly increasing per published snapshot of one run.
    pub sequence: u64,
}

impl RunSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
