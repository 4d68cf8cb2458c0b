//! Runtime step implementations behind the typed builder.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ContextStack;
use crate::engine::Engine;
use crate::error::FlowError;
use crate::flow::FlowNode;

mod bind;
mod call;
mod delay;
mod map;
mod multicall;
mod race;
mod value;
mod zip;

pub use bind::BindStep;
pub use call::CallStep;
pub use delay::DelayStep;
pub use map::MapStep;
pub use multicall::MultiCallStep;
pub use race::RaceResult;
pub use value::ValueStep;
pub use zip::{CollectStep, FanInMode, PostStep, ZipStep};

/// Marks a payload as a branch failure report rather than a real value.
pub(crate) const BRANCH_ERROR_PREFIX: &str = "__branch_error:";

/// What a step's hook told the dispatcher to do with the trace.
#[derive(Debug)]
pub enum StepOutcome {
    /// Frame done, hand the trace to the successor.
    Continue(Option<String>),
    /// Frame stays open; something external completes it later.
    Suspend,
    /// The step persisted and routed the trace itself; the dispatcher
    /// must not touch the state again.
    Routed,
    /// Stop the whole trace cleanly.
    Terminate,
    /// A forked branch trace delivered its result and is done.
    SubflowDone,
    /// Transient trouble; leave the frame retryable for redelivery.
    Retry(String),
    Failed(FlowError),
}

impl StepOutcome {
    /// Errors double as control-flow signals; fold them into the outcome
    /// the dispatcher handles.
    pub fn from_error(err: FlowError) -> Self {
        match err {
            FlowError::Terminated => StepOutcome::Terminate,
            FlowError::SubflowFinished => StepOutcome::SubflowDone,
            FlowError::Retry(reason) => StepOutcome::Retry(reason),
            other => StepOutcome::Failed(other),
        }
    }
}

/// Identity and dispatch metadata of one registered step.
#[derive(Clone)]
pub struct StepDescriptor {
    /// Scoped functional id, unique within the pipeline.
    pub functional: String,
    /// Registry id: `functional + "->" + successor` (or `"end"`).
    pub step_id: String,
    /// Successor step id; `None` for terminal steps.
    pub next: Option<String>,
    /// Enclosing combinator's functional id, for sub-graph scoping.
    pub parent: Option<String>,
    pub pipeline: String,
    pub display_name: Option<String>,
    /// This step may be retried off its pinned host when the pin is
    /// unreachable (it holds no process-local resources).
    pub unpin_safe: bool,
    pub mock: Option<MockFn>,
    pub recover: Option<RecoverFn>,
}

impl StepDescriptor {
    pub fn compose_id(functional: &str, next: Option<&str>) -> String {
        format!("{functional}->{}", next.unwrap_or("end"))
    }
}

/// Structural fingerprint used to keep re-registration idempotent: the
/// same id may be registered again only with an identical shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepShape {
    pub kind: &'static str,
    pub functional: String,
    pub next: Option<String>,
    pub parent: Option<String>,
}

#[async_trait]
pub trait FlowStep: Send + Sync {
    fn descriptor(&self) -> &StepDescriptor;

    fn kind(&self) -> &'static str;

    fn shape(&self) -> StepShape {
        let desc = self.descriptor();
        StepShape {
            kind: self.kind(),
            functional: desc.functional.clone(),
            next: desc.next.clone(),
            parent: desc.parent.clone(),
        }
    }

    /// Invoked when the trace reaches this step (frame already pushed).
    async fn run(&self, engine: &Engine, cx: &mut ContextStack)
        -> Result<StepOutcome, FlowError>;

    /// Invoked when a suspended frame is resumed by the delay scheduler.
    async fn resume(
        &self,
        _engine: &Engine,
        _cx: &mut ContextStack,
    ) -> Result<StepOutcome, FlowError> {
        Ok(StepOutcome::Suspend)
    }

    /// Invoked when an external payload addressed to this step arrives.
    /// Only steps that register entries accept deliveries.
    async fn deliver(
        &self,
        _engine: &Engine,
        _trace_id: &str,
        _index: usize,
        _payload: Option<String>,
    ) -> Result<(), FlowError> {
        Err(FlowError::User {
            step: self.descriptor().step_id.clone(),
            message: "step is not externally callable".to_string(),
        })
    }
}

// Erased hook signatures. The typed builder wraps user closures with
// serde so runtime steps move serialized values only.
pub type MapFn =
    Arc<dyn Fn(&mut ContextStack, Option<String>) -> Result<String, FlowError> + Send + Sync>;
pub type BindFn = Arc<
    dyn Fn(&mut ContextStack, Option<String>) -> Result<Arc<FlowNode>, FlowError> + Send + Sync,
>;
pub type ActionFn =
    Arc<dyn Fn(&mut ContextStack, Option<String>) -> Result<(), FlowError> + Send + Sync>;
pub type TriggerFn = Arc<dyn Fn(&mut ContextStack) -> Result<(), FlowError> + Send + Sync>;
pub type ZipFn =
    Arc<dyn Fn(&mut ContextStack, Vec<Option<String>>) -> Result<String, FlowError> + Send + Sync>;
pub type RaceFn =
    Arc<dyn Fn(&mut ContextStack, RaceResult) -> Result<String, FlowError> + Send + Sync>;
pub type MockFn =
    Arc<dyn Fn(&mut ContextStack, Option<String>) -> Result<String, FlowError> + Send + Sync>;
pub type RecoverFn =
    Arc<dyn Fn(&mut ContextStack, &str) -> Result<String, FlowError> + Send + Sync>;
