use async_trait::async_trait;
use tracing::debug;

use crate::context::ContextStack;
use crate::engine::{backlog_key, Engine, FlowEvent};
use crate::error::FlowError;
use crate::flow::init_sub_chain;
use crate::step::{BindFn, FlowStep, StepDescriptor, StepOutcome};
use crate::store::GlobalStore;

/// Materializes a sub-flow from the step's input and reroutes the trace
/// through it. The sub-graph is scoped under this node and rejoins the
/// outer chain at this node's successor; its registration is idempotent,
/// so repeat traversals reuse the registered steps.
pub struct BindStep {
    desc: StepDescriptor,
    f: BindFn,
}

impl BindStep {
    pub(crate) fn new(desc: StepDescriptor, f: BindFn) -> Self {
        BindStep { desc, f }
    }
}

#[async_trait]
impl FlowStep for BindStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.desc
    }

    fn kind(&self) -> &'static str {
        "then"
    }

    async fn run(
        &self,
        engine: &Engine,
        cx: &mut ContextStack,
    ) -> Result<StepOutcome, FlowError> {
        let param = cx.top().and_then(|f| f.param.clone());
        let sub = (self.f)(cx, param)?;
        let head = init_sub_chain(
            engine,
            &sub,
            &self.desc.pipeline,
            self.desc.next.clone(),
            &self.desc.functional,
        )?;

        cx.end_top(None);
        engine
            .inner
            .global_store
            .decr(&backlog_key(&self.desc.step_id))
            .await?;
        engine.emit(FlowEvent::StepCompleted {
            trace_id: cx.id.clone(),
            step_id: self.desc.step_id.clone(),
            duration_ms: cx.top().and_then(|f| f.cost_ms).unwrap_or(0),
        });
        if cx.no_storage {
            debug!(
                "ephemeral replay stops at {} without entering its sub-flow",
                self.desc.step_id
            );
            return Ok(StepOutcome::Routed);
        }
        cx.next_step = Some(head.clone());
        engine.persist_cx(cx).await?;
        engine
            .activate(&cx.id, &head, None, cx.stack.len(), cx.local)
            .await?;
        Ok(StepOutcome::Routed)
    }
}
