use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{ask_json, bullets, format_subject};
use crate::pipeline::analysis::error::StepError;
use crate::pipeline::analysis::payload::{MedicalHistoryOutput, StepPayload};
use crate::pipeline::analysis::subjects::SubjectContext;
use crate::pipeline::analysis::traits::{StepContext, StepHandler};
use crate::pipeline::analysis::types::StepName;
use crate::pipeline::reasoning::{ReasoningClient, ReasoningRequest};

const SYSTEM_PROMPT: &str = "You are a medical oncology assistant specialized in analyzing \
patient medical histories. Extract and summarize the information relevant to oncology \
treatment planning, flag comorbidities that affect therapy choices, and list critical \
missing information. Do not make treatment recommendations. Respond with JSON only.";

/// Summarizes the patient record. Every other step builds on its output.
pub struct MedicalHistoryStep {
    client: Arc<dyn ReasoningClient>,
}

impl MedicalHistoryStep {
    pub fn new(client: Arc<dyn ReasoningClient>) -> Self {
        Self { client }
    }

    fn build_prompt(subject: &SubjectContext) -> String {
        format!(
            "Analyze the following patient medical history.\n\n\
{patient}\n\n\
RECENT CLINICAL NOTES:\n\
{notes}\n\n\
Incorporate the clinical notes: they hold the latest observations from the care team.\n\n\
OUTPUT FORMAT:\n\
```json\n\
{{\n\
  \"patient_summary\": \"two or three sentence summary\",\n\
  \"cancer_type\": \"cancer type or null\",\n\
  \"stage\": \"stage or null\",\n\
  \"key_findings\": [\"finding relevant to treatment decisions\"],\n\
  \"treatment_considerations\": [\"consideration from comorbidities or organ function\"],\n\
  \"risk_factors\": [\"risk factor to monitor\"],\n\
  \"missing_information\": [\"critical information to obtain\"]\n\
}}\n\
```",
            patient = format_subject(subject, Utc::now().date_naive()),
            notes = bullets(&subject.clinical_notes, "None"),
        )
    }
}

#[async_trait]
impl StepHandler for MedicalHistoryStep {
    fn step(&self) -> StepName {
        StepName::MedicalHistory
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepPayload, StepError> {
        let subject = &ctx.subject;
        let request = ReasoningRequest {
            temperature: 0.2,
            ..ReasoningRequest::new(SYSTEM_PROMPT, Self::build_prompt(subject))
        };
        let mut output: MedicalHistoryOutput = ask_json(self.client.as_ref(), request).await?;

        if output.patient_summary.trim().is_empty() {
            return Err(StepError::MalformedResponse(
                "medical history answer has no patient summary".into(),
            ));
        }
        // The record is authoritative for diagnosis fields the model left out.
        if let Some(details) = &subject.cancer_details {
            if output.cancer_type.is_none() && !details.cancer_type.is_empty() {
                output.cancer_type = Some(details.cancer_type.clone());
            }
            if output.stage.is_none() {
                output.stage = details.stage.clone();
            }
        }

        tracing::debug!(
            run_id = %ctx.run_id,
            findings = output.key_findings.len(),
            missing = output.missing_information.len(),
            "Medical history summarized"
        );
        Ok(StepPayload::MedicalHistory(output))
    }
}
