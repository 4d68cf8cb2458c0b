use async_trait::async_trait;

use crate::context::ContextStack;
use crate::engine::Engine;
use crate::error::FlowError;
use crate::step::{FlowStep, StepDescriptor, StepOutcome};

/// Produces a fixed serialized value and moves on.
pub struct ValueStep {
    desc: StepDescriptor,
    value: String,
}

impl ValueStep {
    pub(crate) fn new(desc: StepDescriptor, value: String) -> Self {
        ValueStep { desc, value }
    }
}

#[async_trait]
impl FlowStep for ValueStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.desc
    }

    fn kind(&self) -> &'static str {
        "value"
    }

    async fn run(
        &self,
        _engine: &Engine,
        _cx: &mut ContextStack,
    ) -> Result<StepOutcome, FlowError> {
        Ok(StepOutcome::Continue(Some(self.value.clone())))
    }
}
