//! Shared API types: handler context and request/response bodies.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core_state::CoreState;
use crate::pipeline::analysis::{
    AnalysisService, CancelOutcome, FeatureFlags, RunRequest, RunSnapshot, RunStatus,
};

// ═══════════════════════════════════════════════════════════
// Handler context
// ═══════════════════════════════════════════════════════════

/// State shared by every handler.
#[derive(Clone)]
pub struct ApiContext {
    pub core: Arc<CoreState>,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>) -> Self {
        Self { core }
    }

    pub fn analysis(&self) -> &AnalysisService {
        self.core.analysis()
    }
}

// ═══════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartAnalysisRequest {
    pub patient_id: String,
    #[serde(default = "default_true")]
    pub include_trials: bool,
    #[serde(default = "default_true")]
    pub include_evidence: bool,
    #[serde(default)]
    pub user_questions: Vec<String>,
    /// Address notified when the run completes.
    #[serde(default)]
    pub user_email: Option<String>,
}

impl StartAnalysisRequest {
    pub fn into_run_request(self) -> RunRequest {
        let email = self.user_email.filter(|e| !e.trim().is_empty());
        RunRequest::new(self.patient_id.trim())
            .with_features(FeatureFlags {
                include_trials: self.include_trials,
                include_evidence: self.include_evidence,
            })
            .with_questions(self.user_questions)
            .with_notify_address(email)
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

// ═══════════════════════════════════════════════════════════
// Responses
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct StartAnalysisResponse {
    pub run_id: String,
    pub patient_id: String,
    pub status: RunStatus,
    pub message: String,
}

impl From<RunSnapshot> for StartAnalysisResponse {
    fn from(snapshot: RunSnapshot) -> Self {
        let message = format!(
            "Analysis started. Use /api/analysis/{}/status to check progress.",
            snapshot.run_id
        );
        Self {
            run_id: snapshot.run_id,
            patient_id: snapshot.subject_id,
            status: snapshot.status,
            message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActiveAnalysisResponse {
    pub patient_id: String,
    pub active: Option<RunSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct StopAnalysisResponse {
    pub run_id: String,
    pub outcome: CancelOutcome,
    pub message: &'static str,
}

impl StopAnalysisResponse {
    pub fn new(run_id: String, outcome: CancelOutcome) -> Self {
        let message = match outcome {
            CancelOutcome::Requested => "Cancellation requested",
            CancelOutcome::AlreadyRequested => "Cancellation already requested",
            CancelOutcome::AlreadyTerminal => "Analysis already finished",
        };
        Self {
            run_id,
            outcome,
            message,
        }
    }
}
