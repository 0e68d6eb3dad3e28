//! Patient context loading.
//!
//! The surrounding application owns patient records; the engine only reads
//! them. Records are JSON documents named `<patient_id>.json`.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::error::SubjectError;
use super::traits::SubjectSource;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CancerDetails {
    pub cancer_type: String,
    pub subtype: Option<String>,
    pub stage: Option<String>,
    pub tnm_staging: Option<String>,
    pub primary_site: Option<String>,
    pub metastases: Vec<String>,
    pub histology: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationRecord {
    pub gene: String,
    pub variant: String,
    pub classification: Option<String>,
    pub allele_frequency: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenomicProfile {
    pub test_type: Option<String>,
    pub mutations: Vec<MutationRecord>,
    /// PD-L1 tumor proportion score, percent.
    pub pdl1_expression: Option<f32>,
    /// Tumor mutational burden, mutations/Mb.
    pub tmb: Option<f32>,
    pub msi_status: Option<String>,
}

/// Patient record as supplied by the surrounding application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectContext {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub cancer_details: Option<CancerDetails>,
    #[serde(default)]
    pub comorbidities: Vec<String>,
    #[serde(default)]
    pub ecog_status: Option<u8>,
    #[serde(default)]
    pub current_medications: Vec<String>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub smoking_status: Option<String>,
    #[serde(default)]
    pub genomics: Option<GenomicProfile>,
    #[serde(default)]
    pub clinical_notes: Vec<String>,
}

impl SubjectContext {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Age in whole years on `today`.
    pub fn age_on(&self, today: NaiveDate) -> Option<u32> {
        self.date_of_birth.and_then(|dob| today.years_since(dob))
    }

    /// One-line description used in prompts and summaries.
    pub fn headline(&self) -> String {
        let cancer = self
            .cancer_details
            .as_ref()
            .map(|c| match &c.stage {
                Some(stage) => format!("{} {}", stage, c.cancer_type),
                None => c.cancer_type.clone(),
            })
            .unwrap_or_else(|| "cancer type not recorded".into());
        format!("{} ({})", self.full_name(), cancer)
    }

    /// Reject records no step can work with.
    pub fn validate(&self) -> Result<(), SubjectError> {
        if self.id.trim().is_empty() {
            return Err(SubjectError::Invalid("record has an empty id".into()));
        }
        if let Some(ecog) = self.ecog_status {
            if ecog > 5 {
                return Err(SubjectError::Invalid(format!(
                    "ECOG status {ecog} out of range 0-5"
                )));
            }
        }
        Ok(())
    }
}

/// Patient ids become file names; only `[A-Za-z0-9_-]` is accepted.
pub fn validate_subject_id(id: &str) -> Result<(), SubjectError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(SubjectError::InvalidId(id.to_string()))
    }
}

/// Reads `<dir>/<patient_id>.json`.
pub struct JsonFileSubjectSource {
    dir: PathBuf,
}

impl JsonFileSubjectSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SubjectSource for JsonFileSubjectSource {
    async fn load(&self, subject_id: &str) -> Result<SubjectContext, SubjectError> {
        validate_subject_id(subject_id)?;
        let path = self.dir.join(format!("{subject_id}.json"));

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SubjectError::NotFound(subject_id.to_string()))
            }
            Err(e) => return Err(SubjectError::Invalid(e.to_string())),
        };

        let subject: SubjectContext =
            serde_json::from_str(&raw).map_err(|e| SubjectError::Invalid(e.to_string()))?;
        if subject.id != subject_id {
            return Err(SubjectError::Invalid(format!(
                "record id {} does not match requested id {subject_id}",
                subject.id
            )));
        }
        subject.validate()?;
        Ok(subject)
    }
}

/// Fixed set of records held in memory.
#[derive(Default)]
pub struct InMemorySubjectSource {
    subjects: HashMap<String, SubjectContext>,
}

impl InMemorySubjectSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, subject: SubjectContext) -> Self {
        self.subjects.insert(subject.id.clone(), subject);
        self
    }
}

#[async_trait]
impl SubjectSource for InMemorySubjectSource {
    async fn load(&self, subject_id: &str) -> Result<SubjectContext, SubjectError> {
        let subject = self
            .subjects
            .get(subject_id)
            .cloned()
            .ok_or_else(|| SubjectError::NotFound(subject_id.to_string()))?;
        subject.validate()?;
        Ok(subject)
    }
}

/// Minimal NSCLC record used across tests.
#[cfg(test)]
pub(crate) fn sample_subject(id: &str) -> SubjectContext {
    SubjectContext {
        id: id.to_string(),
        first_name: "Maria".into(),
        last_name: "Santos".into(),
        date_of_birth: NaiveDate::from_ymd_opt(1962, 4, 12),
        sex: Some("female".into()),
        cancer_details: Some(CancerDetails {
            cancer_type: "NSCLC".into(),
            subtype: Some("adenocarcinoma".into()),
            stage: Some("Stage IIIA".into()),
            primary_site: Some("right upper lobe".into()),
            ..Default::default()
        }),
        comorbidities: vec!["type 2 diabetes".into()],
        ecog_status: Some(1),
        current_medications: vec!["metformin".into()],
        allergies: Vec::new(),
        smoking_status: Some("former".into()),
        genomics: Some(GenomicProfile {
            mutations: vec![MutationRecord {
                gene: "EGFR".into(),
                variant: "exon19del".into(),
                classification: Some("pathogenic".into()),
                allele_frequency: None,
            }],
            pdl1_expression: Some(40.0),
            ..Default::default()
        }),
        clinical_notes: vec!["Presented with persistent cough.".into()],
    }
}
