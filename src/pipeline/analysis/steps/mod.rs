//! The six analysis steps.
//!
//! Each step:
//! 1. Builds a prompt from the patient context and typed prior payloads
//! 2. Calls the reasoning service once
//! 3. Sanitizes the model output and parses the JSON block into its payload
//!
//! Synthesis is the exception: it merges prior payloads without a model call.

pub mod clinical_trials;
pub mod evidence;
pub mod genomics;
pub mod medical_history;
pub mod synthesis;
pub mod treatment;

pub use clinical_trials::ClinicalTrialsStep;
pub use evidence::EvidenceStep;
pub use genomics::GenomicsStep;
pub use medical_history::MedicalHistoryStep;
pub use synthesis::SynthesisStep;
pub use treatment::TreatmentStep;

use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::error::StepError;
use super::subjects::SubjectContext;
use super::traits::StepHandler;
use crate::pipeline::reasoning::{
    extract_json, sanitize_model_output, ReasoningClient, ReasoningRequest,
};

/// One handler per step, all sharing the same reasoning client.
pub fn standard_handlers(client: Arc<dyn ReasoningClient>) -> Vec<Arc<dyn StepHandler>> {
    let mut handlers: Vec<Arc<dyn StepHandler>> = Vec::with_capacity(6);
    handlers.push(Arc::new(MedicalHistoryStep::new(client.clone())));
    handlers.push(Arc::new(GenomicsStep::new(client.clone())));
    handlers.push(Arc::new(ClinicalTrialsStep::new(client.clone())));
    handlers.push(Arc::new(EvidenceStep::new(client.clone())));
    handlers.push(Arc::new(TreatmentStep::new(client)));
    handlers.push(Arc::new(SynthesisStep::new()));
    handlers
}

// ═══════════════════════════════════════════
// Shared helpers
// ═══════════════════════════════════════════

/// Send one request and parse the JSON block of the answer into `T`.
///
/// Output that holds no parseable JSON is a transient failure: the same
/// prompt usually succeeds on the next attempt.
pub(crate) async fn ask_json<T: DeserializeOwned>(
    client: &dyn ReasoningClient,
    request: ReasoningRequest,
) -> Result<T, StepError> {
    let raw = client.complete(&request).await?;
    let cleaned = sanitize_model_output(&raw);
    let block = extract_json(&cleaned)
        .ok_or_else(|| StepError::MalformedResponse("no JSON block in model output".into()))?;
    serde_json::from_str(block).map_err(|e| StepError::MalformedResponse(e.to_string()))
}

fn or_none_recorded(items: &[String]) -> String {
    if items.is_empty() {
        "None recorded".to_string()
    } else {
        items.join(", ")
    }
}

fn or_unknown(value: Option<&str>) -> &str {
    value.unwrap_or("Unknown")
}

/// Bullet list, or a placeholder line when empty.
fn bullets(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return format!("- {empty}");
    }
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Patient block shared by every prompt.
fn format_subject(subject: &SubjectContext, today: chrono::NaiveDate) -> String {
    let age = subject
        .age_on(today)
        .map(|a| a.to_string())
        .unwrap_or_else(|| "Unknown".into());
    let cancer = match &subject.cancer_details {
        Some(c) => format!(
            "{}{}, {}, primary site {}, histology {}{}",
            c.cancer_type,
            c.subtype
                .as_deref()
                .map(|s| format!(" ({s})"))
                .unwrap_or_default(),
            or_unknown(c.stage.as_deref()),
            or_unknown(c.primary_site.as_deref()),
            or_unknown(c.histology.as_deref()),
            if c.metastases.is_empty() {
                String::new()
            } else {
                format!(", metastases: {}", c.metastases.join(", "))
            },
        ),
        None => "Not available".into(),
    };
    let ecog = subject
        .ecog_status
        .map(|e| e.to_string())
        .unwrap_or_else(|| "Not assessed".into());

    format!(
        "Patient ID: {id}\n\
Age: {age}\n\
Sex: {sex}\n\
Cancer: {cancer}\n\
ECOG status: {ecog}\n\
Comorbidities: {comorbidities}\n\
Current medications: {meds}\n\
Allergies: {allergies}\n\
Smoking history: {smoking}",
        id = subject.id,
        sex = or_unknown(subject.sex.as_deref()),
        comorbidities = or_none_recorded(&subject.comorbidities),
        meds = or_none_recorded(&subject.current_medications),
        allergies = or_none_recorded(&subject.allergies),
        smoking = or_unknown(subject.smoking_status.as_deref()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::analysis::payload::MedicalHistoryOutput;
    use crate::pipeline::analysis::subjects::sample_subject;
    use crate::pipeline::reasoning::{MockReasoningClient, ReasoningError};
    use chrono::NaiveDate;

    #[tokio::test]
    async fn ask_json_accepts_fenced_and_thinking_output() {
        let client = MockReasoningClient::new(
            "<unused94>thought\nlet me look\n```json\n{\"patient_summary\": \"ok\"}\n```",
        );
        let out: MedicalHistoryOutput = ask_json(&client, ReasoningRequest::new("s", "p"))
            .await
            .unwrap();
        assert_eq!(out.patient_summary, "ok");
    }

    #[tokio::test]
    async fn ask_json_without_json_is_transient() {
        let client = MockReasoningClient::new("I cannot help with that.");
        let err = ask_json::<MedicalHistoryOutput>(&client, ReasoningRequest::new("s", "p"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("Malformed model response"));
    }

    #[tokio::test]
    async fn ask_json_passes_service_errors_through() {
        let client = MockReasoningClient::failing(ReasoningError::Rejected {
            status: 400,
            body: "bad model".into(),
        });
        let err = ask_json::<MedicalHistoryOutput>(&client, ReasoningRequest::new("s", "p"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn standard_handlers_cover_every_step() {
        let client: Arc<dyn ReasoningClient> = Arc::new(MockReasoningClient::new("{}"));
        let mut steps: Vec<_> = standard_handlers(client).iter().map(|h| h.step()).collect();
        steps.sort();
        assert_eq!(steps, crate::pipeline::analysis::types::StepName::all());
    }

    #[test]
    fn subject_block_lists_core_facts() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let block = format_subject(&sample_subject("p1"), today);
        assert!(block.contains("Age: 63"));
        assert!(block.contains("NSCLC (adenocarcinoma), Stage IIIA"));
        assert!(block.contains("Allergies: None recorded"));
    }

    #[test]
    fn bullets_placeholder_when_empty() {
        assert_eq!(bullets(&[], "none"), "- none");
        assert_eq!(bullets(&["a".into(), "b".into()], "none"), "- a\n- b");
    }
}
