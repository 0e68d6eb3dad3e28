use std::sync::Arc;

use async_trait::async_trait;

use super::{ask_json, bullets};
use crate::pipeline::analysis::error::StepError;
use crate::pipeline::analysis::payload::{
    EvidenceOutput, MedicalHistoryOutput, QuestionAnswer, StepPayload,
};
use crate::pipeline::analysis::subjects::SubjectContext;
use crate::pipeline::analysis::traits::{StepContext, StepHandler};
use crate::pipeline::analysis::types::StepName;
use crate::pipeline::reasoning::{ReasoningClient, ReasoningRequest};

const SYSTEM_PROMPT: &str = "You are a medical evidence specialist. Summarize the literature \
and guideline recommendations (NCCN, ASCO, ESMO) relevant to this patient, cite specific \
publications, note evidence levels, and answer the care team's questions directly. \
Respond with JSON only.";

/// Literature search terms derived from the record, most specific last.
fn search_terms(subject: &SubjectContext, history: &MedicalHistoryOutput) -> Vec<String> {
    let mut terms = Vec::new();
    if let Some(cancer) = &history.cancer_type {
        terms.push(cancer.clone());
        if let Some(stage) = &history.stage {
            terms.push(format!("{cancer} {stage}"));
        }
    }
    if let Some(genomics) = &subject.genomics {
        for m in &genomics.mutations {
            terms.push(format!("{} {}", m.gene, m.variant));
        }
    }
    terms
}

/// Literature review plus answers to the request's supplementary questions.
pub struct EvidenceStep {
    client: Arc<dyn ReasoningClient>,
}

impl EvidenceStep {
    pub fn new(client: Arc<dyn ReasoningClient>) -> Self {
        Self { client }
    }

    fn build_prompt(history: &MedicalHistoryOutput, terms: &[String], questions: &[String]) -> String {
        format!(
            "Review the medical literature and guidelines for this patient.\n\n\
PATIENT SUMMARY:\n\
{summary}\n\n\
KEY FINDINGS:\n\
{findings}\n\n\
SEARCH TERMS:\n\
{terms}\n\n\
QUESTIONS FROM THE CARE TEAM:\n\
{questions}\n\n\
Answer every question above in \"answers\", in the same order.\n\n\
OUTPUT FORMAT:\n\
```json\n\
{{\n\
  \"summary\": \"one paragraph\",\n\
  \"search_terms\": [\"term\"],\n\
  \"publications\": [\n\
    {{\"title\": \"title\", \"journal\": \"journal or null\", \"year\": 2024, \"finding\": \"key result\"}}\n\
  ],\n\
  \"answers\": [{{\"question\": \"question\", \"answer\": \"answer\"}}]\n\
}}\n\
```",
            summary = history.patient_summary,
            findings = bullets(&history.key_findings, "None"),
            terms = bullets(terms, "None"),
            questions = bullets(questions, "None"),
        )
    }
}

#[async_trait]
impl StepHandler for EvidenceStep {
    fn step(&self) -> StepName {
        StepName::Evidence
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepPayload, StepError> {
        let history = ctx.prior.require_medical_history()?;
        let terms = search_terms(&ctx.subject, history);
        let questions: Vec<String> = ctx
            .request
            .questions
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();

        let request = ReasoningRequest::new(
            SYSTEM_PROMPT,
            Self::build_prompt(history, &terms, &questions),
        );
        let mut output: EvidenceOutput = ask_json(self.client.as_ref(), request).await?;

        if output.search_terms.is_empty() {
            output.search_terms = terms;
        }
        output.publications.retain(|p| !p.title.trim().is_empty());
        // Every question gets an entry, even if the model skipped it.
        for question in &questions {
            if !output.answers.iter().any(|a| a.question == *question) {
                output.answers.push(QuestionAnswer {
                    question: question.clone(),
                    answer: "No answer found in the reviewed evidence".into(),
                });
            }
        }

        Ok(StepPayload::Evidence(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::analysis::testing::{default_payload, step_context};
    use crate::pipeline::analysis::types::RunRequest;
    use crate::pipeline::reasoning::MockReasoningClient;

    #[tokio::test]
    async fn questions_reach_prompt_and_get_answers() {
        let client = Arc::new(MockReasoningClient::new(
            r#"{"summary": "FLAURA supports osimertinib",
                "publications": [{"title": "FLAURA", "journal": "NEJM", "year": 2018, "finding": "PFS benefit"},
                                 {"title": "", "finding": "dropped"}],
                "answers": [{"question": "Is osimertinib first line?", "answer": "Yes"}]}"#,
        ));
        let request = RunRequest::new("p1").with_questions(vec![
            "Is osimertinib first line?".into(),
            "  ".into(),
            "Role of radiotherapy?".into(),
        ]);
        let ctx = step_context(request, vec![default_payload(StepName::MedicalHistory)]);

        let payload = EvidenceStep::new(client.clone()).run(&ctx).await.unwrap();
        let StepPayload::Evidence(out) = payload else {
            panic!("wrong payload variant");
        };
        assert_eq!(out.publications.len(), 1);
        assert_eq!(out.answers.len(), 2);
        assert_eq!(out.answers[1].question, "Role of radiotherapy?");
        assert_eq!(
            out.search_terms,
            vec!["NSCLC", "NSCLC Stage IIIA", "EGFR exon19del"]
        );

        let prompt = &client.requests()[0].prompt;
        assert!(prompt.contains("- Is osimertinib first line?"));
        assert!(prompt.contains("- Role of radiotherapy?"));
    }

    #[tokio::test]
    async fn no_questions_no_answers() {
        let client = Arc::new(MockReasoningClient::new(
            r#"{"summary": "s", "search_terms": ["EGFR NSCLC"]}"#,
        ));
        let ctx = step_context(
            RunRequest::new("p1"),
            vec![default_payload(StepName::MedicalHistory)],
        );
        let payload = EvidenceStep::new(client).run(&ctx).await.unwrap();
        let StepPayload::Evidence(out) = payload else {
            panic!("wrong payload variant");
        };
        assert!(out.answers.is_empty());
        assert_eq!(out.search_terms, vec!["EGFR NSCLC"]);
    }
}
