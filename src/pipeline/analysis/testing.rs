//! Scripted step handlers shared by the pipeline tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::error::StepError;
use super::payload::*;
use super::traits::{StepContext, StepHandler};
use super::subjects::sample_subject;
use super::types::{RunRequest, StepName};

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Succeed,
    Fail(StepError),
    /// Sleep, then succeed.
    Delay(Duration),
    /// Sleep, then fail.
    DelayThenFail(Duration, StepError),
    Panic,
    /// Return a payload for a different step.
    WrongPayload,
}

pub(crate) fn default_payload(step: StepName) -> StepPayload {
    match step {
        StepName::MedicalHistory => StepPayload::MedicalHistory(MedicalHistoryOutput {
            patient_summary: "62 year old female, NSCLC".into(),
            cancer_type: Some("NSCLC".into()),
            stage: Some("Stage IIIA".into()),
            key_findings: vec!["Stage IIIA adenocarcinoma".into()],
            ..Default::default()
        }),
        StepName::Genomics => StepPayload::Genomics(GenomicsOutput {
            summary: "EGFR exon 19 deletion".into(),
            actionable_mutations: vec!["EGFR".into()],
            ..Default::default()
        }),
        StepName::ClinicalTrials => StepPayload::ClinicalTrials(ClinicalTrialsOutput {
            summary: "One match".into(),
            trials: vec![TrialMatch {
                nct_id: "NCT04035486".into(),
                title: "Osimertinib adjuvant".into(),
                match_score: 80,
                ..Default::default()
            }],
        }),
        StepName::Evidence => StepPayload::Evidence(EvidenceOutput {
            summary: "Strong evidence for osimertinib".into(),
            search_terms: vec!["EGFR NSCLC osimertinib".into()],
            ..Default::default()
        }),
        StepName::Treatment => StepPayload::Treatment(TreatmentOutput {
            primary_recommendation: Some(TreatmentOption {
                name: "Osimertinib".into(),
                rationale: "EGFR-mutant".into(),
                evidence_level: Some("Category 1".into()),
            }),
            ..Default::default()
        }),
        StepName::Synthesis => StepPayload::Synthesis(SynthesisOutput {
            summary: "Synthesized".into(),
            ..Default::default()
        }),
    }
}

pub(crate) struct ScriptedHandler {
    step: StepName,
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    calls: AtomicU32,
    seen_prior: Mutex<Vec<Vec<StepName>>>,
}

impl ScriptedHandler {
    pub(crate) fn new(step: StepName, fallback: Behavior) -> Self {
        Self {
            step,
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicU32::new(0),
            seen_prior: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn succeeding(step: StepName) -> Self {
        Self::new(step, Behavior::Succeed)
    }

    /// Queue behaviors consumed one per attempt before the fallback.
    pub(crate) fn then(self, behavior: Behavior) -> Self {
        self.script.lock().unwrap().push_back(behavior);
        self
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prior-result keys visible at each call.
    pub(crate) fn seen_prior(&self) -> Vec<Vec<StepName>> {
        self.seen_prior.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepHandler for ScriptedHandler {
    fn step(&self) -> StepName {
        self.step
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepPayload, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_prior
            .lock()
            .unwrap()
            .push(ctx.prior.iter().map(|(step, _)| *step).collect());
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match behavior {
            Behavior::Succeed => Ok(default_payload(self.step)),
            Behavior::Fail(e) => Err(e),
            Behavior::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(default_payload(self.step))
            }
            Behavior::DelayThenFail(d, e) => {
                tokio::time::sleep(d).await;
                Err(e)
            }
            Behavior::Panic => panic!("scripted panic in {}", self.step),
            Behavior::WrongPayload => Ok(default_payload(if self.step == StepName::Synthesis {
                StepName::MedicalHistory
            } else {
                StepName::Synthesis
            })),
        }
    }
}

/// Handlers for every standard step: the given overrides, succeeding otherwise.
pub(crate) fn handlers_with(overrides: Vec<Arc<ScriptedHandler>>) -> Vec<Arc<dyn StepHandler>> {
    StepName::all()
        .iter()
        .map(|step| {
            match overrides.iter().find(|h| h.step == *step) {
                Some(h) => h.clone() as Arc<dyn StepHandler>,
                None => Arc::new(ScriptedHandler::succeeding(*step)) as Arc<dyn StepHandler>,
            }
        })
        .collect()
}

/// Context for calling one real step handler against the sample patient.
pub(crate) fn step_context(request: RunRequest, prior: Vec<StepPayload>) -> StepContext {
    StepContext {
        run_id: "run-test".into(),
        subject: Arc::new(sample_subject(&request.subject_id)),
        request: Arc::new(request),
        prior: PriorResults::new(prior.into_iter().map(|p| (p.step(), p)).collect()),
        attempt: 1,
    }
}
