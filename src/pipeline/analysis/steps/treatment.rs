use std::sync::Arc;

use async_trait::async_trait;

use super::{ask_json, bullets, or_none_recorded};
use crate::pipeline::analysis::error::StepError;
use crate::pipeline::analysis::payload::{
    ClinicalTrialsOutput, EvidenceOutput, GenomicsOutput, MedicalHistoryOutput, PriorResults,
    StepPayload, TreatmentOutput,
};
use crate::pipeline::analysis::subjects::SubjectContext;
use crate::pipeline::analysis::traits::{StepContext, StepHandler};
use crate::pipeline::analysis::types::StepName;
use crate::pipeline::reasoning::{ReasoningClient, ReasoningRequest};

const SYSTEM_PROMPT: &str = "You are an oncology treatment planning specialist. Combine all \
patient data into ranked treatment options, accounting for comorbidities, drug interactions \
and allergies, with an evidence-based rationale for each. Present options for physician \
review; never make the final decision. Respond with JSON only.";

/// Trials listed in the treatment prompt.
const PROMPT_TRIALS: usize = 3;

/// Typed view of everything the treatment step reads from earlier steps.
///
/// History and genomics are required; trials and literature are present only
/// when their optional steps ran and succeeded.
#[derive(Debug)]
pub struct TreatmentInput<'a> {
    pub history: &'a MedicalHistoryOutput,
    pub genomics: &'a GenomicsOutput,
    pub trials: Option<&'a ClinicalTrialsOutput>,
    pub evidence: Option<&'a EvidenceOutput>,
}

impl<'a> TreatmentInput<'a> {
    pub fn from_prior(prior: &'a PriorResults) -> Result<Self, StepError> {
        Ok(Self {
            history: prior.require_medical_history()?,
            genomics: prior.require_genomics()?,
            trials: prior.clinical_trials(),
            evidence: prior.evidence(),
        })
    }
}

pub struct TreatmentStep {
    client: Arc<dyn ReasoningClient>,
}

impl TreatmentStep {
    pub fn new(client: Arc<dyn ReasoningClient>) -> Self {
        Self { client }
    }

    fn build_prompt(subject: &SubjectContext, input: &TreatmentInput<'_>) -> String {
        let trials: Vec<String> = input
            .trials
            .map(|t| {
                t.trials
                    .iter()
                    .take(PROMPT_TRIALS)
                    .map(|m| format!("{}: {} (match {}%)", m.nct_id, m.title, m.match_score))
                    .collect()
            })
            .unwrap_or_default();
        let evidence = input
            .evidence
            .map(|e| e.summary.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("Not available");

        format!(
            "Recommend treatment options for this patient.\n\n\
PATIENT SUMMARY:\n\
{summary}\n\n\
TREATMENT CONSIDERATIONS:\n\
{considerations}\n\n\
GENOMICS:\n\
{genomics}\n\
Targeted therapy candidates: {targeted}\n\
Immunotherapy candidate: {immuno}\n\n\
ALLERGIES: {allergies}\n\
CURRENT MEDICATIONS: {meds}\n\n\
CLINICAL TRIALS:\n\
{trials}\n\n\
EVIDENCE:\n\
{evidence}\n\n\
OUTPUT FORMAT:\n\
```json\n\
{{\n\
  \"primary_recommendation\": {{\"name\": \"regimen\", \"rationale\": \"why\", \"evidence_level\": \"Category 1 or null\"}},\n\
  \"alternatives\": [{{\"name\": \"regimen\", \"rationale\": \"why\", \"evidence_level\": null}}],\n\
  \"discussion_points\": [\"point for the care team\"],\n\
  \"rationale\": \"overall reasoning\"\n\
}}\n\
```",
            summary = input.history.patient_summary,
            considerations = bullets(&input.history.treatment_considerations, "None"),
            genomics = input.genomics.summary,
            targeted = or_none_recorded(&input.genomics.targeted_therapy_candidates),
            immuno = if input.genomics.immunotherapy_candidate { "yes" } else { "no" },
            allergies = or_none_recorded(&subject.allergies),
            meds = or_none_recorded(&subject.current_medications),
            trials = bullets(&trials, "None identified"),
        )
    }
}

#[async_trait]
impl StepHandler for TreatmentStep {
    fn step(&self) -> StepName {
        StepName::Treatment
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepPayload, StepError> {
        let input = TreatmentInput::from_prior(&ctx.prior)?;
        let request = ReasoningRequest::new(SYSTEM_PROMPT, Self::build_prompt(&ctx.subject, &input));
        let mut output: TreatmentOutput = ask_json(self.client.as_ref(), request).await?;

        let has_primary = output
            .primary_recommendation
            .as_ref()
            .is_some_and(|p| !p.name.trim().is_empty());
        if !has_primary {
            return Err(StepError::MalformedResponse(
                "treatment answer has no primary recommendation".into(),
            ));
        }
        output.alternatives.retain(|a| !a.name.trim().is_empty());

        Ok(StepPayload::Treatment(output))
    }
}
