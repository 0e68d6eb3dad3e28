//! Typed step outputs.
//!
//! Each step produces exactly one [`StepPayload`] variant. Downstream steps
//! read prior outputs through [`PriorResults`], never through untyped maps.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::StepError;
use super::types::StepName;

/// Sources listed in a report are capped to this many entries.
pub const MAX_SOURCES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedicalHistoryOutput {
    pub patient_summary: String,
    pub cancer_type: Option<String>,
    pub stage: Option<String>,
    pub key_findings: Vec<String>,
    pub treatment_considerations: Vec<String>,
    pub risk_factors: Vec<String>,
    pub missing_information: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenomicsOutput {
    pub summary: String,
    pub actionable_mutations: Vec<String>,
    pub targeted_therapy_candidates: Vec<String>,
    pub immunotherapy_candidate: bool,
    pub key_findings: Vec<String>,
    pub treatment_implications: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialMatch {
    pub nct_id: String,
    pub title: String,
    pub phase: Option<String>,
    /// Match strength, 0-100.
    pub match_score: u8,
    pub rationale: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinicalTrialsOutput {
    pub summary: String,
    pub trials: Vec<TrialMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Publication {
    pub title: String,
    pub journal: Option<String>,
    pub year: Option<u16>,
    pub finding: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestionAnswer {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceOutput {
    pub summary: String,
    pub search_terms: Vec<String>,
    pub publications: Vec<Publication>,
    pub answers: Vec<QuestionAnswer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreatmentOption {
    pub name: String,
    pub rationale: String,
    pub evidence_level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreatmentOutput {
    pub primary_recommendation: Option<TreatmentOption>,
    pub alternatives: Vec<TreatmentOption>,
    pub discussion_points: Vec<String>,
    pub rationale: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisOutput {
    pub summary: String,
    pub key_findings: Vec<String>,
    pub recommendations: Vec<String>,
    pub discussion_points: Vec<String>,
    pub sources: Vec<String>,
}

/// Closed set of step outputs, tagged by step name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", content = "data", rename_all = "snake_case")]
pub enum StepPayload {
    MedicalHistory(MedicalHistoryOutput),
    Genomics(GenomicsOutput),
    ClinicalTrials(ClinicalTrialsOutput),
    Evidence(EvidenceOutput),
    Treatment(TreatmentOutput),
    Synthesis(SynthesisOutput),
}

impl StepPayload {
    pub fn step(&self) -> StepName {
        match self {
            Self::MedicalHistory(_) => StepName::MedicalHistory,
            Self::Genomics(_) => StepName::Genomics,
            Self::ClinicalTrials(_) => StepName::ClinicalTrials,
            Self::Evidence(_) => StepName::Evidence,
            Self::Treatment(_) => StepName::Treatment,
            Self::Synthesis(_) => StepName::Synthesis,
        }
    }

    /// Literature sources this payload consulted.
    pub fn sources(&self) -> Vec<String> {
        match self {
            Self::Evidence(e) => e
                .search_terms
                .iter()
                .map(|t| format!("PubMed: {t}"))
                .chain(e.publications.iter().filter_map(|p| p.journal.clone()))
                .collect(),
            Self::Synthesis(s) => s.sources.clone(),
            _ => Vec::new(),
        }
    }
}

/// Deduplicate preserving first occurrence, capped at [`MAX_SOURCES`].
pub fn dedup_sources<I>(sources: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for source in sources {
        if out.len() == MAX_SOURCES {
            break;
        }
        if !source.is_empty() && !out.contains(&source) {
            out.push(source);
        }
    }
    out
}

/// Immutable view of the payloads accumulated so far in a run.
///
/// Cloning is cheap; every step of a wave gets the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct PriorResults {
    inner: Arc<BTreeMap<StepName, StepPayload>>,
}

impl PriorResults {
    pub fn new(map: BTreeMap<StepName, StepPayload>) -> Self {
        Self {
            inner: Arc::new(map),
        }
    }

    pub fn get(&self, step: StepName) -> Option<&StepPayload> {
        self.inner.get(&step)
    }

    pub fn contains(&self, step: StepName) -> bool {
        self.inner.contains_key(&step)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StepName, &StepPayload)> {
        self.inner.iter()
    }

    pub fn medical_history(&self) -> Option<&MedicalHistoryOutput> {
        match self.get(StepName::MedicalHistory) {
            Some(StepPayload::MedicalHistory(o)) => Some(o),
            _ => None,
        }
    }

    pub fn genomics(&self) -> Option<&GenomicsOutput> {
        match self.get(StepName::Genomics) {
            Some(StepPayload::Genomics(o)) => Some(o),
            _ => None,
        }
    }

    pub fn clinical_trials(&self) -> Option<&ClinicalTrialsOutput> {
        match self.get(StepName::ClinicalTrials) {
            Some(StepPayload::ClinicalTrials(o)) => Some(o),
            _ => None,
        }
    }

    pub fn evidence(&self) -> Option<&EvidenceOutput> {
        match self.get(StepName::Evidence) {
            Some(StepPayload::Evidence(o)) => Some(o),
            _ => None,
        }
    }

    pub fn treatment(&self) -> Option<&TreatmentOutput> {
        match self.get(StepName::Treatment) {
            Some(StepPayload::Treatment(o)) => Some(o),
            _ => None,
        }
    }

    pub fn synthesis(&self) -> Option<&SynthesisOutput> {
        match self.get(StepName::Synthesis) {
            Some(StepPayload::Synthesis(o)) => Some(o),
            _ => None,
        }
    }

    pub fn require_medical_history(&self) -> Result<&MedicalHistoryOutput, StepError> {
        self.medical_history()
            .ok_or(StepError::MissingPriorResult(StepName::MedicalHistory))
    }

    pub fn require_genomics(&self) -> Result<&GenomicsOutput, StepError> {
        self.genomics()
            .ok_or(StepError::MissingPriorResult(StepName::Genomics))
    }

    pub fn require_treatment(&self) -> Result<&TreatmentOutput, StepError> {
        self.treatment()
            .ok_or(StepError::MissingPriorResult(StepName::Treatment))
    }
}
