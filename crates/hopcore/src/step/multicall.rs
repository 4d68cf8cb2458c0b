use async_trait::async_trait;
use tracing::{debug, warn};

use crate::context::ContextStack;
use crate::engine::Engine;
use crate::error::FlowError;
use crate::step::{ActionFn, FlowStep, StepDescriptor, StepOutcome, BRANCH_ERROR_PREFIX};
use crate::store::GlobalStore;

/// One step backed by several call types. With `and_merge` the step
/// resolves when every call type has delivered; without it the first
/// clean delivery wins and the rest are dropped.
///
/// Arrivals are coordinated through the global store, not the trace
/// state, so deliveries may land on any process. A stored slot is
/// prefixed with `+` to tell an absent payload from an absent delivery.
pub struct MultiCallStep {
    desc: StepDescriptor,
    call_types: Vec<String>,
    and_merge: bool,
    action: Option<ActionFn>,
}

impl MultiCallStep {
    pub(crate) fn new(
        desc: StepDescriptor,
        call_types: Vec<String>,
        and_merge: bool,
        action: Option<ActionFn>,
    ) -> Self {
        MultiCallStep {
            desc,
            call_types,
            and_merge,
            action,
        }
    }

    fn counter_key(&self, trace_id: &str) -> String {
        format!("arrive:{}:{trace_id}", self.desc.step_id)
    }

    fn error_key(&self, trace_id: &str) -> String {
        format!("arrive_err:{}:{trace_id}", self.desc.step_id)
    }

    fn slot_key(&self, trace_id: &str, index: usize) -> String {
        format!("arrive:{}:{trace_id}:{index}", self.desc.step_id)
    }

    async fn assemble(
        &self,
        engine: &Engine,
        trace_id: &str,
    ) -> Result<Vec<Option<String>>, FlowError> {
        let mut results = Vec::with_capacity(self.call_types.len());
        for index in 0..self.call_types.len() {
            let slot = engine
                .inner
                .global_store
                .get(&self.slot_key(trace_id, index))
                .await?;
            results.push(match slot.as_deref() {
                Some(occupied) if occupied.starts_with('+') => {
                    let value = &occupied[1..];
                    if value == "null" {
                        None
                    } else {
                        Some(value.to_string())
                    }
                }
                _ => None,
            });
        }
        Ok(results)
    }

    /// Put the counters and slots back to vacant so a replayed trace can
    /// gather again. The counter is forced down even if a straggler
    /// bumped it mid-reset.
    async fn reset(&self, engine: &Engine, trace_id: &str) -> Result<(), FlowError> {
        let store = &engine.inner.global_store;
        for key in [self.counter_key(trace_id), self.error_key(trace_id)] {
            while store.decr(&key).await? > -1 {}
            let settled = store.incr(&key).await?;
            if settled != 0 {
                warn!(
                    "arrival counter {key} settled at {settled} after reset on {trace_id}"
                );
            }
        }
        for index in 0..self.call_types.len() {
            store.put(&self.slot_key(trace_id, index), "null").await?;
        }
        Ok(())
    }

    async fn resolve(&self, engine: &Engine, trace_id: &str) -> Result<(), FlowError> {
        let results = self.assemble(engine, trace_id).await?;
        self.reset(engine, trace_id).await?;
        let json = serde_json::to_string(&results)?;
        engine
            .complete_step(trace_id, &self.desc.step_id, Some(json))
            .await
    }
}

#[async_trait]
impl FlowStep for MultiCallStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.desc
    }

    fn kind(&self) -> &'static str {
        "multi-call"
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
        index: usize,
        payload: Option<String>,
    ) -> Result<(), FlowError> {
        let arity = self.call_types.len();
        if index >= arity {
            return Err(FlowError::User {
                step: self.desc.step_id.clone(),
                message: format!("arrival index {index} out of range ({arity} call types)"),
            });
        }
        if engine.load_cx(trace_id).await?.is_none() {
            debug!(
                "arrival for {} on fresh trace {trace_id}, opening it",
                self.desc.step_id
            );
            engine.call_step(trace_id, &self.desc.step_id, None).await?;
        }

        let store = &engine.inner.global_store;
        let slot_key = self.slot_key(trace_id, index);
        if let Some(existing) = store.get(&slot_key).await? {
            if existing != "null" {
                debug!(
                    "duplicate arrival {index} for {} on {trace_id} dropped",
                    self.desc.step_id
                );
                return Ok(());
            }
        }
        store
            .put(
                &slot_key,
                &format!("+{}", payload.as_deref().unwrap_or("null")),
            )
            .await?;

        if self.and_merge {
            let total = store.incr(&self.counter_key(trace_id)).await?;
            if total < arity as i64 {
                return Ok(());
            }
            return self.resolve(engine, trace_id).await;
        }

        let failed = payload
            .as_deref()
            .map(|p| p.starts_with(BRANCH_ERROR_PREFIX))
            .unwrap_or(false);
        if failed {
            // A failure never wins the race; it only resolves once every
            // slot is a failure.
            let errors = store.incr(&self.error_key(trace_id)).await?;
            if errors < arity as i64 {
                return Ok(());
            }
            return self.resolve(engine, trace_id).await;
        }
        let claims = store.incr(&self.counter_key(trace_id)).await?;
        if claims != 1 {
            store.decr(&self.counter_key(trace_id)).await?;
            debug!(
                "race for {} on {trace_id} already resolved, arrival {index} dropped",
                self.desc.step_id
            );
            return Ok(());
        }
        self.resolve(engine, trace_id).await
    }
}
