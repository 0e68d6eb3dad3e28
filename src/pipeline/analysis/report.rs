//! Final run report and the deterministic summary composition.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::payload::{dedup_sources, PriorResults, StepPayload, SynthesisOutput};
use super::state::{progress_of, RunState};
use super::subjects::SubjectContext;
use super::types::{RunSnapshot, RunStatus, StepFailure, StepName, StepStatus};

/// Findings taken from each contributing step.
const FINDINGS_PER_STEP: usize = 3;

/// Immutable record of a finished run. Built once at the terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub subject_id: String,
    pub status: RunStatus,
    pub summary: String,
    pub key_findings: Vec<String>,
    pub recommendations: Vec<String>,
    pub discussion_points: Vec<String>,
    pub payloads: BTreeMap<StepName, StepPayload>,
    pub step_statuses: BTreeMap<StepName, StepStatus>,
    #[serde(default)]
    pub failures: BTreeMap<StepName, StepFailure>,
    pub sources: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunReport {
    /// Build from a terminal run state.
    ///
    /// Completed runs take their narrative from the synthesis payload; error
    /// and cancelled runs get a best-effort narrative from whatever finished.
    pub fn build(state: &RunState, subject: Option<&SubjectContext>) -> Self {
        let prior = state.prior_results();
        let composed = match prior.synthesis() {
            Some(s) => s.clone(),
            None => compose_synthesis(subject, &prior, Utc::now().date_naive()),
        };

        let summary = match state.status() {
            RunStatus::Cancelled => "Analysis cancelled by user".to_string(),
            RunStatus::Error => {
                let message = state.error().unwrap_or("unknown error");
                match first_failed_step(state) {
                    Some(step) => format!("Analysis failed at step {step}: {message}"),
                    None => format!("Analysis failed: {message}"),
                }
            }
            _ => composed.summary,
        };

        Self {
            run_id: state.run_id().to_string(),
            subject_id: state.subject_id().to_string(),
            status: state.status(),
            summary,
            key_findings: composed.key_findings,
            recommendations: composed.recommendations,
            discussion_points: composed.discussion_points,
            payloads: state.results().clone(),
            step_statuses: state.step_statuses().clone(),
            failures: state.failures().clone(),
            sources: composed.sources,
            error: state.error().map(str::to_string),
            created_at: state.created_at(),
            completed_at: state.completed_at().unwrap_or_else(Utc::now),
        }
    }

    /// Terminal snapshot rebuilt from the stored report, for runs already
    /// evicted from the registry.
    pub fn to_snapshot(&self) -> RunSnapshot {
        let steps_completed: Vec<StepName> = self
            .step_statuses
            .iter()
            .filter(|(_, s)| **s == StepStatus::Done)
            .map(|(step, _)| *step)
            .collect();
        let progress = progress_of(&self.step_statuses, self.status);

        RunSnapshot {
            run_id: self.run_id.clone(),
            subject_id: self.subject_id.clone(),
            status: self.status,
            current_step: None,
            current_step_detail: None,
            step_statuses: self.step_statuses.clone(),
            steps_completed,
            steps_remaining: Vec::new(),
            progress,
            error: self.error.clone(),
            cancel_requested: self.status == RunStatus::Cancelled,
            created_at: self.created_at,
            completed_at: Some(self.completed_at),
            sequence: 0,
        }
    }
}

fn first_failed_step(state: &RunState) -> Option<StepName> {
    state
        .step_statuses()
        .iter()
        .find(|(_, s)| **s == StepStatus::Failed)
        .map(|(step, _)| *step)
}

/// Merge the prior payloads into the final narrative. No model call.
pub fn compose_synthesis(
    subject: Option<&SubjectContext>,
    prior: &PriorResults,
    today: NaiveDate,
) -> SynthesisOutput {
    let mut key_findings = Vec::new();
    if let Some(history) = prior.medical_history() {
        key_findings.extend(history.key_findings.iter().take(FINDINGS_PER_STEP).cloned());
    }
    if let Some(genomics) = prior.genomics() {
        key_findings.extend(genomics.key_findings.iter().take(FINDINGS_PER_STEP).cloned());
    }

    let mut recommendations = Vec::new();
    let mut discussion_points = Vec::new();
    if let Some(treatment) = prior.treatment() {
        if let Some(primary) = &treatment.primary_recommendation {
            if !primary.name.is_empty() {
                recommendations.push(format!("Primary recommendation: {}", primary.name));
            }
        }
        recommendations.extend(treatment.discussion_points.iter().cloned());
        discussion_points = treatment.discussion_points.clone();
    }

    let sources = dedup_sources(
        prior
            .iter()
            .filter(|(step, _)| **step != StepName::Synthesis)
            .flat_map(|(_, payload)| payload.sources()),
    );

    SynthesisOutput {
        summary: compose_summary(subject, prior, today),
        key_findings,
        recommendations,
        discussion_points,
        sources,
    }
}

fn compose_summary(
    subject: Option<&SubjectContext>,
    prior: &PriorResults,
    today: NaiveDate,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(subject) = subject {
        let age = subject.age_on(today);
        let sex = subject.sex.as_deref().unwrap_or("");
        let who = match (age, sex.is_empty()) {
            (Some(age), true) => format!("{age} year old"),
            (Some(age), false) => format!("{age} year old {sex}"),
            (None, false) => format!("{sex} patient"),
            (None, true) => "Patient".to_string(),
        };

        let history = prior.medical_history();
        let cancer_type = history
            .and_then(|h| h.cancer_type.clone())
            .or_else(|| subject.cancer_details.as_ref().map(|c| c.cancer_type.clone()));
        let stage = history
            .and_then(|h| h.stage.clone())
            .or_else(|| subject.cancer_details.as_ref().and_then(|c| c.stage.clone()));

        parts.push(match (cancer_type, stage) {
            (Some(t), Some(s)) => format!("{who} with {t}, {s}"),
            (Some(t), None) => format!("{who} with {t}"),
            _ => who,
        });
    }

    if let Some(genomics) = prior.genomics() {
        if !genomics.actionable_mutations.is_empty() {
            parts.push(format!(
                "Actionable mutations: {}",
                genomics.actionable_mutations.join(", ")
            ));
        }
        if genomics.immunotherapy_candidate {
            parts.push("Immunotherapy likely beneficial".to_string());
        }
    }

    if let Some(primary) = prior
        .treatment()
        .and_then(|t| t.primary_recommendation.as_ref())
    {
        parts.push(format!("Recommended treatment: {}", primary.name));
    }

    if let Some(trials) = prior.clinical_trials() {
        match trials.trials.len() {
            0 => {}
            1 => parts.push("1 clinical trial identified".to_string()),
            n => parts.push(format!("{n} clinical trials identified")),
        }
    }

    if parts.is_empty() {
        return "No analysis results available.".to_string();
    }
    format!("{}.", parts.join(". "))
}
