//! Fan-out and fan-in. A zip (or race) step forks each branch into its
//! own trace, steps the parent into an internal join that gathers branch
//! results, and an internal collect resumes the user's chain with the
//! gathered values.

use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

use crate::context::{ContextStack, FrameStatus, GatherPost};
use crate::engine::{backlog_key, Engine, FlowEvent};
use crate::error::FlowError;
use crate::step::race::find_winner;
use crate::step::{
    FlowStep, RaceFn, StepDescriptor, StepOutcome, TriggerFn, ZipFn, BRANCH_ERROR_PREFIX,
};
use crate::store::GlobalStore;

/// How a fan-in resolves: all branches, or the first clean one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanInMode {
    Zip,
    Race,
}

/// Forks the branches and parks the parent trace on the join.
pub struct ZipStep {
    desc: StepDescriptor,
    join_id: String,
    call_types: Vec<String>,
    branch_heads: Vec<String>,
    triggers: Vec<TriggerFn>,
}

impl ZipStep {
    pub(crate) fn new(
        desc: StepDescriptor,
        join_id: String,
        call_types: Vec<String>,
        branch_heads: Vec<String>,
        triggers: Vec<TriggerFn>,
    ) -> Self {
        ZipStep {
            desc,
            join_id,
            call_types,
            branch_heads,
            triggers,
        }
    }
}

#[async_trait]
impl FlowStep for ZipStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.desc
    }

    fn kind(&self) -> &'static str {
        "fan-out"
    }

    async fn run(
        &self,
        engine: &Engine,
        cx: &mut ContextStack,
    ) -> Result<StepOutcome, FlowError> {
        if cx.no_storage {
            debug!(
                "ephemeral replay leaves {} unforked",
                self.desc.step_id
            );
            return Ok(StepOutcome::Suspend);
        }

        // Step the parent into the join before any branch exists, so the
        // earliest possible branch result finds an open frame.
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
        cx.next_step = Some(self.join_id.clone());
        engine.persist_cx(cx).await?;
        engine.call_step(&cx.id, &self.join_id, None).await?;

        let Some(mut parked) = engine.load_cx(&cx.id).await? else {
            return Err(FlowError::Retry(format!(
                "trace {} vanished while forking {}",
                cx.id, self.desc.step_id
            )));
        };
        let base_len = parked.stack.len();
        let child_ids: Vec<String> = (0..self.branch_heads.len())
            .map(|index| format!("{}_{base_len}-{index}", parked.id))
            .collect();
        if let Some(top) = parked.top_mut() {
            top.child_tasks = child_ids.clone();
        }
        engine.persist_cx(&parked).await?;

        for (index, head) in self.branch_heads.iter().enumerate() {
            let gather = GatherPost {
                call_type: self.call_types[index].clone(),
                node: self.join_id.clone(),
                index,
            };
            let mut child = parked.fork_child(child_ids[index].clone(), gather);
            child.next_step = Some(head.clone());
            engine.persist_cx(&child).await?;
            engine
                .activate(&child.id, head, None, child.stack.len(), child.local)
                .await?;
        }

        // Triggers fire on the parent once the forks are on record; they
        // may read the child ids off the join frame. Skipped when the
        // branches already resolved the join underneath us.
        let latest = engine.load_cx(&parked.id).await?;
        let waiting = latest.as_ref().map(|l| {
            !l.finished
                && matches!(
                    l.top(),
                    Some(top) if top.name == self.join_id && top.status == FrameStatus::Begin
                )
        });
        if let (Some(latest), Some(true)) = (latest, waiting) {
            *cx = latest;
            for trigger in &self.triggers {
                trigger(cx)?;
            }
            engine.persist_cx(cx).await?;
        }
        Ok(StepOutcome::Routed)
    }
}

/// Resumes the user's chain with the gathered branch results, merging
/// branch scratch state back into the parent trace first.
pub struct CollectStep {
    desc: StepDescriptor,
    mode: FanInMode,
    arity: usize,
    combiner: Option<ZipFn>,
    judger: Option<RaceFn>,
}

impl CollectStep {
    pub(crate) fn new(
        desc: StepDescriptor,
        mode: FanInMode,
        arity: usize,
        combiner: Option<ZipFn>,
        judger: Option<RaceFn>,
    ) -> Self {
        CollectStep {
            desc,
            mode,
            arity,
            combiner,
            judger,
        }
    }

    /// Fold each branch's new global keys into the parent. Keys the
    /// parent held before the fork are left alone (every child inherited
    /// them); colliding sibling keys get a numeric suffix.
    async fn merge_children(
        &self,
        engine: &Engine,
        cx: &mut ContextStack,
    ) -> Result<(), FlowError> {
        let children = cx
            .stack
            .iter()
            .rev()
            .find(|f| !f.child_tasks.is_empty())
            .map(|f| f.child_tasks.clone());
        let Some(children) = children else {
            return Ok(());
        };
        let inherited: HashSet<String> = cx.global.keys().cloned().collect();
        for child_id in &children {
            let Some(child) = engine.load_cx(child_id).await? else {
                debug!("branch state {child_id} is gone, skipping its scratch data");
                continue;
            };
            for (key, value) in child.global {
                if inherited.contains(&key) {
                    continue;
                }
                if !cx.global.contains_key(&key) {
                    cx.global.insert(key, value);
                    continue;
                }
                let mut suffix = 1;
                loop {
                    let candidate = format!("{key}{suffix}");
                    if !cx.global.contains_key(&candidate) {
                        cx.global.insert(candidate, value);
                        break;
                    }
                    suffix += 1;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FlowStep for CollectStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.desc
    }

    fn kind(&self) -> &'static str {
        "fan-in"
    }

    async fn run(
        &self,
        engine: &Engine,
        cx: &mut ContextStack,
    ) -> Result<StepOutcome, FlowError> {
        let param = cx.top().and_then(|f| f.param.clone());
        let Some(raw) = param else {
            return Err(FlowError::User {
                step: self.desc.step_id.clone(),
                message: "fan-in resumed with no gathered results".to_string(),
            });
        };
        let mut slots: Vec<Option<String>> = serde_json::from_str(&raw)?;
        slots.resize(self.arity, None);

        self.merge_children(engine, cx).await?;

        match self.mode {
            FanInMode::Zip => {
                for (index, slot) in slots.iter().enumerate() {
                    if let Some(report) = slot
                        .as_deref()
                        .and_then(|s| s.strip_prefix(BRANCH_ERROR_PREFIX))
                    {
                        return Err(FlowError::User {
                            step: self.desc.step_id.clone(),
                            message: format!("branch {index} failed: {report}"),
                        });
                    }
                }
                let value = match &self.combiner {
                    Some(combiner) => combiner(cx, slots)?,
                    None => {
                        let joined = slots
                            .iter()
                            .map(|slot| slot.as_deref().unwrap_or("null"))
                            .collect::<Vec<_>>()
                            .join(",");
                        format!("[{joined}]")
                    }
                };
                Ok(StepOutcome::Continue(Some(value)))
            }
            FanInMode::Race => {
                let Some(winner) = find_winner(&slots) else {
                    return Err(FlowError::User {
                        step: self.desc.step_id.clone(),
                        message: "every branch failed".to_string(),
                    });
                };
                let value = match &self.judger {
                    Some(judger) => judger(cx, winner)?,
                    None => winner.value,
                };
                Ok(StepOutcome::Continue(Some(value)))
            }
        }
    }
}

/// Terminal step of a forked branch: hands the branch's result to the
/// join on the parent trace, then finishes the branch.
pub struct PostStep {
    desc: StepDescriptor,
    gather: GatherPost,
}

impl PostStep {
    pub(crate) fn new(desc: StepDescriptor, gather: GatherPost) -> Self {
        PostStep { desc, gather }
    }
}

#[async_trait]
impl FlowStep for PostStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.desc
    }

    fn kind(&self) -> &'static str {
        "post"
    }

    async fn run(
        &self,
        engine: &Engine,
        cx: &mut ContextStack,
    ) -> Result<StepOutcome, FlowError> {
        let Some(parent) = cx.parent_trace.clone() else {
            return Err(FlowError::User {
                step: self.desc.step_id.clone(),
                message: "branch result posted outside a forked trace".to_string(),
            });
        };
        let payload = cx.top().and_then(|f| f.param.clone());
        let Some(join) = engine.step(&self.gather.node) else {
            return Err(FlowError::NotInited(self.gather.node.clone()));
        };
        join.deliver(engine, &parent, self.gather.index, payload)
            .await?;
        Ok(StepOutcome::SubflowDone)
    }
}
