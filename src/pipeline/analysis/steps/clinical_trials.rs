use std::sync::Arc;

use async_trait::async_trait;

use super::{ask_json, bullets};
use crate::pipeline::analysis::error::StepError;
use crate::pipeline::analysis::payload::{ClinicalTrialsOutput, MedicalHistoryOutput, StepPayload};
use crate::pipeline::analysis::subjects::SubjectContext;
use crate::pipeline::analysis::traits::{StepContext, StepHandler};
use crate::pipeline::analysis::types::StepName;
use crate::pipeline::reasoning::{ReasoningClient, ReasoningRequest};

const SYSTEM_PROMPT: &str = "You are a clinical trials specialist. Match patient \
characteristics to trial eligibility criteria, rank trials by likelihood of eligibility, \
and explain why each trial may or may not be appropriate. Prefer recruiting trials. \
Respond with JSON only.";

/// Matches kept in the payload, best first.
const MAX_TRIALS: usize = 10;

pub struct ClinicalTrialsStep {
    client: Arc<dyn ReasoningClient>,
}

impl ClinicalTrialsStep {
    pub fn new(client: Arc<dyn ReasoningClient>) -> Self {
        Self { client }
    }

    fn build_prompt(subject: &SubjectContext, history: &MedicalHistoryOutput) -> String {
        let criteria: Vec<String> = [
            history.cancer_type.as_ref().map(|c| format!("Cancer type: {c}")),
            history.stage.as_ref().map(|s| format!("Stage: {s}")),
            subject.ecog_status.map(|e| format!("ECOG: {e}")),
        ]
        .into_iter()
        .flatten()
        .chain(
            subject
                .genomics
                .iter()
                .flat_map(|g| g.mutations.iter())
                .map(|m| format!("Mutation: {} {}", m.gene, m.variant)),
        )
        .collect();

        format!(
            "Find clinical trials this patient may be eligible for.\n\n\
PATIENT SUMMARY:\n\
{summary}\n\n\
SEARCH CRITERIA:\n\
{criteria}\n\n\
TREATMENT CONSIDERATIONS:\n\
{considerations}\n\n\
OUTPUT FORMAT:\n\
```json\n\
{{\n\
  \"summary\": \"one paragraph\",\n\
  \"trials\": [\n\
    {{\n\
      \"nct_id\": \"NCT########\",\n\
      \"title\": \"trial title\",\n\
      \"phase\": \"Phase 2 or null\",\n\
      \"match_score\": 0-100,\n\
      \"rationale\": \"why the patient may qualify\"\n\
    }}\n\
  ]\n\
}}\n\
```",
            summary = history.patient_summary,
            criteria = bullets(&criteria, "No criteria available"),
            considerations = bullets(&history.treatment_considerations, "None"),
        )
    }
}

#[async_trait]
impl StepHandler for ClinicalTrialsStep {
    fn step(&self) -> StepName {
        StepName::ClinicalTrials
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepPayload, StepError> {
        let history = ctx.prior.require_medical_history()?;
        let request =
            ReasoningRequest::new(SYSTEM_PROMPT, Self::build_prompt(&ctx.subject, history));
        let mut output: ClinicalTrialsOutput = ask_json(self.client.as_ref(), request).await?;

        output.trials.retain(|t| !t.nct_id.trim().is_empty());
        for trial in &mut output.trials {
            trial.match_score = trial.match_score.min(100);
        }
        output
            .trials
            .sort_by(|a, b| b.match_score.cmp(&a.match_score));
        output.trials.truncate(MAX_TRIALS);

        tracing::debug!(run_id = %ctx.run_id, trials = output.trials.len(), "Trials matched");
        Ok(StepPayload::ClinicalTrials(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::analysis::testing::{default_payload, step_context};
    use crate::pipeline::analysis::types::RunRequest;
    use crate::pipeline::reasoning::MockReasoningClient;

    #[tokio::test]
    async fn trials_ranked_and_unnamed_dropped() {
        let client = Arc::new(MockReasoningClient::new(
            r#"{"summary": "3 candidates", "trials": [
                {"nct_id": "NCT01", "title": "A", "match_score": 40},
                {"nct_id": "", "title": "no id", "match_score": 99},
                {"nct_id": "NCT02", "title": "B", "match_score": 200}
            ]}"#,
        ));
        let ctx = step_context(
            RunRequest::new("p1"),
            vec![default_payload(StepName::MedicalHistory)],
        );
        let payload = ClinicalTrialsStep::new(client.clone()).run(&ctx).await.unwrap();
        let StepPayload::ClinicalTrials(out) = payload else {
            panic!("wrong payload variant");
        };
        let ids: Vec<_> = out.trials.iter().map(|t| t.nct_id.as_str()).collect();
        assert_eq!(ids, vec!["NCT02", "NCT01"]);
        assert_eq!(out.trials[0].match_score, 100);

        let prompt = &client.requests()[0].prompt;
        assert!(prompt.contains("- Mutation: EGFR exon19del"));
        assert!(prompt.contains("- Stage: Stage IIIA"));
    }

    #[tokio::test]
    async fn upstream_failure_propagates() {
        let client = Arc::new(MockReasoningClient::failing(
            crate::pipeline::reasoning::ReasoningError::RateLimited,
        ));
        let ctx = step_context(
            RunRequest::new("p1"),
            vec![default_payload(StepName::MedicalHistory)],
        );
        let err = ClinicalTrialsStep::new(client).run(&ctx).await.unwrap_err();
        assert!(err.is_transient());
    }
}
