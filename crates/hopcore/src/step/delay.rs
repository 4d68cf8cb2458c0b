use std::time::Duration;

use async_trait::async_trait;

use crate::context::ContextStack;
use crate::engine::Engine;
use crate::error::FlowError;
use crate::step::{FlowStep, StepDescriptor, StepOutcome};

/// Produces a fixed value once its delay has elapsed. The wait itself is
/// owned by the configured scheduler; the trace suspends in the store.
pub struct DelayStep {
    desc: StepDescriptor,
    value: String,
    delay: Duration,
}

impl DelayStep {
    pub(crate) fn new(desc: StepDescriptor, value: String, delay: Duration) -> Self {
        DelayStep { desc, value, delay }
    }
}

#[async_trait]
impl FlowStep for DelayStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.desc
    }

    fn kind(&self) -> &'static str {
        "delayed value"
    }

    async fn run(
        &self,
        engine: &Engine,
        cx: &mut ContextStack,
    ) -> Result<StepOutcome, FlowError> {
        let Some(delays) = engine.inner.delays.clone() else {
            return Err(FlowError::Channel(
                "delayed value with no delay scheduler configured".to_string(),
            ));
        };
        delays
            .schedule(
                engine.clone(),
                cx.id.clone(),
                self.desc.step_id.clone(),
                self.delay,
            )
            .await?;
        Ok(StepOutcome::Suspend)
    }

    async fn resume(
        &self,
        _engine: &Engine,
        _cx: &mut ContextStack,
    ) -> Result<StepOutcome, FlowError> {
        Ok(StepOutcome::Continue(Some(self.value.clone())))
    }
}
