use async_trait::async_trait;

use crate::context::ContextStack;
use crate::engine::Engine;
use crate::error::FlowError;
use crate::step::{FlowStep, MapFn, StepDescriptor, StepOutcome};

/// Applies a user transform to the folded input of its frame.
pub struct MapStep {
    desc: StepDescriptor,
    f: MapFn,
}

impl MapStep {
    pub(crate) fn new(desc: StepDescriptor, f: MapFn) -> Self {
        MapStep { desc, f }
    }
}

#[async_trait]
impl FlowStep for MapStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.desc
    }

    fn kind(&self) -> &'static str {
        "map"
    }

    async fn run(
        &self,
        _engine: &Engine,
        cx: &mut ContextStack,
    ) -> Result<StepOutcome, FlowError> {
        let param = cx.top().and_then(|f| f.param.clone());
        let value = (self.f)(cx, param)?;
        Ok(StepOutcome::Continue(Some(value)))
    }
}
