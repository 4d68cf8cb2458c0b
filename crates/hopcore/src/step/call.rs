use async_trait::async_trait;
use tracing::debug;

use crate::context::ContextStack;
use crate::engine::Engine;
use crate::error::FlowError;
use crate::step::{ActionFn, FlowStep, StepDescriptor, StepOutcome};

/// Suspends the trace until an external caller answers its call type.
///
/// The open frame is persisted before `run` is invoked, so the answer may
/// arrive while the action that requests it is still on the stack.
pub struct CallStep {
    desc: StepDescriptor,
    call_type: String,
    action: Option<ActionFn>,
}

impl CallStep {
    pub(crate) fn new(
        desc: StepDescriptor,
        call_type: String,
        action: Option<ActionFn>,
    ) -> Self {
        CallStep {
            desc,
            call_type,
            action,
        }
    }
}

#[async_trait]
impl FlowStep for CallStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.desc
    }

    fn kind(&self) -> &'static str {
        "call"
    }

    async fn run(
        &self,
        _engine: &Engine,
        cx: &mut ContextStack,
    ) -> Result<StepOutcome, FlowError> {
        if let Some(action) = &self.action {
            let param = cx.top().and_then(|f| f.param.clone());
            action(cx, param)?;
        }
        Ok(StepOutcome::Suspend)
    }

    async fn deliver(
        &self,
        engine: &Engine,
        trace_id: &str,
        _index: usize,
        payload: Option<String>,
    ) -> Result<(), FlowError> {
        // An entry call may be the trace's first contact: open the frame
        // here, then treat the payload as its answer.
        if engine.load_cx(trace_id).await?.is_none() {
            debug!(
                "call {} on fresh trace {trace_id}, opening it",
                self.call_type
            );
            engine.call_step(trace_id, &self.desc.step_id, None).await?;
        }
        engine
            .complete_step(trace_id, &self.desc.step_id, payload)
            .await
    }
}
