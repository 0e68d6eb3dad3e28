use async_trait::async_trait;
use chrono::Utc;

use crate::pipeline::analysis::error::StepError;
use crate::pipeline::analysis::payload::StepPayload;
use crate::pipeline::analysis::report::compose_synthesis;
use crate::pipeline::analysis::traits::{StepContext, StepHandler};
use crate::pipeline::analysis::types::StepName;

/// Terminal step: folds every prior payload into the final narrative.
///
/// Deterministic; makes no reasoning-service call.
#[derive(Debug, Default)]
pub struct SynthesisStep;

impl SynthesisStep {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepHandler for SynthesisStep {
    fn step(&self) -> StepName {
        StepName::Synthesis
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepPayload, StepError> {
        ctx.prior.require_treatment()?;
        let today = Utc::now().date_naive();
        let output = compose_synthesis(Some(ctx.subject.as_ref()), &ctx.prior, today);
        Ok(StepPayload::Synthesis(output))
    }
}
