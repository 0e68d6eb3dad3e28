use std::sync::Arc;

use async_trait::async_trait;

use super::{ask_json, bullets};
use crate::pipeline::analysis::error::StepError;
use crate::pipeline::analysis::payload::{GenomicsOutput, MedicalHistoryOutput, StepPayload};
use crate::pipeline::analysis::subjects::GenomicProfile;
use crate::pipeline::analysis::traits::{StepContext, StepHandler};
use crate::pipeline::analysis::types::StepName;
use crate::pipeline::reasoning::{ReasoningClient, ReasoningRequest};

const SYSTEM_PROMPT: &str = "You are a genomics and precision oncology specialist. Interpret \
genomic test results, match actionable mutations to approved targeted therapies, assess \
immunotherapy markers (PD-L1, TMB, MSI) and note resistance mutations. Be precise and note \
the level of evidence. Respond with JSON only.";

/// (gene, variant pattern, approved targeted therapies). Patterns are compared
/// after normalization, so "exon 19 del" matches "exon19del".
const ACTIONABLE: &[(&str, &str, &[&str])] = &[
    ("EGFR", "exon 19 del", &["Osimertinib", "Erlotinib", "Gefitinib", "Afatinib"]),
    ("EGFR", "L858R", &["Osimertinib", "Erlotinib", "Gefitinib", "Afatinib"]),
    ("EGFR", "T790M", &["Osimertinib"]),
    ("EGFR", "exon 20 ins", &["Amivantamab", "Mobocertinib"]),
    ("ALK", "fusion", &["Alectinib", "Brigatinib", "Lorlatinib", "Crizotinib"]),
    ("ROS1", "fusion", &["Crizotinib", "Entrectinib", "Lorlatinib"]),
    ("BRAF", "V600E", &["Dabrafenib + Trametinib"]),
    ("KRAS", "G12C", &["Sotorasib", "Adagrasib"]),
    ("MET", "exon 14 skip", &["Capmatinib", "Tepotinib"]),
    ("RET", "fusion", &["Selpercatinib", "Pralsetinib"]),
    ("NTRK", "fusion", &["Larotrectinib", "Entrectinib"]),
    ("HER2", "amplification", &["Trastuzumab deruxtecan"]),
];

const PDL1_HIGH: f32 = 50.0;
const TMB_HIGH: f32 = 10.0;

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Approved therapies for the profile's mutations, first match order, no duplicates.
fn known_therapies(profile: &GenomicProfile) -> Vec<String> {
    let mut therapies: Vec<String> = Vec::new();
    for mutation in &profile.mutations {
        let variant = normalize(&mutation.variant);
        for (gene, pattern, drugs) in ACTIONABLE {
            if mutation.gene.eq_ignore_ascii_case(gene) && variant.contains(&normalize(pattern)) {
                for drug in drugs.iter() {
                    if !therapies.iter().any(|t| t == drug) {
                        therapies.push(drug.to_string());
                    }
                }
            }
        }
    }
    therapies
}

/// High PD-L1, high TMB or MSI-H.
fn immunotherapy_markers_high(profile: &GenomicProfile) -> bool {
    profile.pdl1_expression.is_some_and(|v| v >= PDL1_HIGH)
        || profile.tmb.is_some_and(|v| v >= TMB_HIGH)
        || profile
            .msi_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("MSI-H"))
}

/// Payload for a patient with no genomic testing on record.
fn no_report_output() -> GenomicsOutput {
    GenomicsOutput {
        summary: "No genomic report available".into(),
        key_findings: vec!["Genomic testing not performed".into()],
        treatment_implications: vec![
            "Comprehensive genomic profiling recommended before selecting targeted therapy".into(),
        ],
        ..Default::default()
    }
}

pub struct GenomicsStep {
    client: Arc<dyn ReasoningClient>,
}

impl GenomicsStep {
    pub fn new(client: Arc<dyn ReasoningClient>) -> Self {
        Self { client }
    }

    fn build_prompt(
        history: &MedicalHistoryOutput,
        profile: &GenomicProfile,
        known: &[String],
    ) -> String {
        let mutations: Vec<String> = profile
            .mutations
            .iter()
            .map(|m| {
                let mut line = format!("{} {}", m.gene, m.variant);
                if let Some(c) = &m.classification {
                    line.push_str(&format!(" ({c})"));
                }
                if let Some(vaf) = m.allele_frequency {
                    line.push_str(&format!(", VAF {vaf:.2}"));
                }
                line
            })
            .collect();
        let opt = |v: Option<f32>, unit: &str| {
            v.map(|v| format!("{v}{unit}"))
                .unwrap_or_else(|| "Not tested".into())
        };

        format!(
            "Analyze the genomic report of this patient.\n\n\
Cancer type: {cancer}\n\
Stage: {stage}\n\
Test: {test}\n\n\
MUTATIONS:\n\
{mutations}\n\n\
IMMUNOTHERAPY MARKERS:\n\
- PD-L1: {pdl1}\n\
- TMB: {tmb}\n\
- MSI: {msi}\n\n\
Therapies approved for the listed mutations: {known}\n\n\
OUTPUT FORMAT:\n\
```json\n\
{{\n\
  \"summary\": \"one paragraph\",\n\
  \"actionable_mutations\": [\"GENE variant\"],\n\
  \"targeted_therapy_candidates\": [\"drug\"],\n\
  \"immunotherapy_candidate\": true or false,\n\
  \"key_findings\": [\"finding\"],\n\
  \"treatment_implications\": [\"implication\"]\n\
}}\n\
```",
            cancer = history.cancer_type.as_deref().unwrap_or("Unknown"),
            stage = history.stage.as_deref().unwrap_or("Unknown"),
            test = profile.test_type.as_deref().unwrap_or("Unspecified panel"),
            mutations = bullets(&mutations, "No mutations reported"),
            pdl1 = opt(profile.pdl1_expression, "%"),
            tmb = opt(profile.tmb, " mut/Mb"),
            msi = profile.msi_status.as_deref().unwrap_or("Not tested"),
            known = if known.is_empty() {
                "none".to_string()
            } else {
                known.join(", ")
            },
        )
    }
}

#[async_trait]
impl StepHandler for GenomicsStep {
    fn step(&self) -> StepName {
        StepName::Genomics
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepPayload, StepError> {
        let history = ctx.prior.require_medical_history()?;
        let Some(profile) = &ctx.subject.genomics else {
            tracing::debug!(run_id = %ctx.run_id, "No genomic report on record");
            return Ok(StepPayload::Genomics(no_report_output()));
        };

        let known = known_therapies(profile);
        let request = ReasoningRequest {
            temperature: 0.2,
            ..ReasoningRequest::new(SYSTEM_PROMPT, Self::build_prompt(history, profile, &known))
        };
        let mut output: GenomicsOutput = ask_json(self.client.as_ref(), request).await?;

        if output.targeted_therapy_candidates.is_empty() {
            output.targeted_therapy_candidates = known;
        }
        if !output.immunotherapy_candidate && immunotherapy_markers_high(profile) {
            output.immunotherapy_candidate = true;
        }

        Ok(StepPayload::Genomics(output))
    }
}
