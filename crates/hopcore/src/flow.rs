//! The typed flow builder and the deterministic identity walk.
//!
//! A `Flow<T>` is a handle to an untyped node graph plus the value type
//! it produces. Combinators wrap user closures with serde so the runtime
//! moves serialized values only; node identity is derived at init time
//! from explicit ids and graph shape, never from memory addresses, so
//! every process that builds the same pipeline registers the same steps.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::{ContextStack, GatherPost};
use crate::engine::Engine;
use crate::entry::{entry_key, Entry, EntryTarget};
use crate::error::{BuildError, FlowError, Result};
use crate::step::{
    ActionFn, BindFn, BindStep, CallStep, CollectStep, DelayStep, FanInMode, MapFn, MapStep,
    MockFn, MultiCallStep, PostStep, RaceFn, RaceResult, RecoverFn, StepDescriptor, TriggerFn,
    ValueStep, ZipFn, ZipStep,
};

pub(crate) enum NodeKind {
    Value {
        value: String,
    },
    DelayedValue {
        value: String,
        delay: Duration,
    },
    Map {
        source: Arc<FlowNode>,
        f: MapFn,
    },
    Bind {
        source: Arc<FlowNode>,
        f: BindFn,
    },
    Call {
        call_type: String,
        action: Option<ActionFn>,
    },
    MultiCall {
        call_types: Vec<String>,
        and_merge: bool,
        action: Option<ActionFn>,
    },
    FanIn {
        mode: FanInMode,
        branches: Vec<Arc<FlowNode>>,
        combiner: Option<ZipFn>,
        judger: Option<RaceFn>,
    },
}

impl NodeKind {
    fn describe(&self) -> &'static str {
        match self {
            NodeKind::Value { .. } => "value",
            NodeKind::DelayedValue { .. } => "delayed value",
            NodeKind::Map { .. } => "map",
            NodeKind::Bind { .. } => "then",
            NodeKind::Call { .. } => "call",
            NodeKind::MultiCall { .. } => "multi-call",
            NodeKind::FanIn {
                mode: FanInMode::Zip,
                ..
            } => "zip",
            NodeKind::FanIn {
                mode: FanInMode::Race,
                ..
            } => "race",
        }
    }
}

/// One node of the untyped graph behind `Flow<T>`.
pub struct FlowNode {
    pub(crate) kind: NodeKind,
    id: OnceLock<String>,
    display_name: RwLock<Option<String>>,
    unpin_safe: AtomicBool,
    mock: RwLock<Option<MockFn>>,
    recover: RwLock<Option<RecoverFn>>,
    triggers: RwLock<Vec<TriggerFn>>,
    inited: AtomicBool,
}

impl FlowNode {
    fn new(kind: NodeKind) -> Arc<Self> {
        Arc::new(FlowNode {
            kind,
            id: OnceLock::new(),
            display_name: RwLock::new(None),
            unpin_safe: AtomicBool::new(false),
            mock: RwLock::new(None),
            recover: RwLock::new(None),
            triggers: RwLock::new(Vec::new()),
            inited: AtomicBool::new(false),
        })
    }

    fn display_name(&self) -> Option<String> {
        self.display_name.read().ok().and_then(|n| n.clone())
    }

    fn mock_fn(&self) -> Option<MockFn> {
        self.mock.read().ok().and_then(|m| m.clone())
    }

    fn recover_fn(&self) -> Option<RecoverFn> {
        self.recover.read().ok().and_then(|r| r.clone())
    }

    fn trigger_fns(&self) -> Vec<TriggerFn> {
        self.triggers.read().map(|t| t.clone()).unwrap_or_default()
    }
}

/// Typed handle to a flow graph producing `T`.
pub struct Flow<T> {
    node: Arc<FlowNode>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Flow {
            node: Arc::clone(&self.node),
            _marker: PhantomData,
        }
    }
}

// Manual impl: the node graph holds user closures, so Debug cannot be
// derived.
impl<T> std::fmt::Debug for Flow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.node.id.get())
            .field("kind", &self.node.kind.describe())
            .finish_non_exhaustive()
    }
}

/// Type-erased flow handle, for fan-ins over heterogeneous branches.
pub struct AnyFlow {
    node: Arc<FlowNode>,
}

impl<T> From<Flow<T>> for AnyFlow {
    fn from(flow: Flow<T>) -> Self {
        AnyFlow { node: flow.node }
    }
}

fn missing_input(step: &str) -> FlowError {
    FlowError::User {
        step: step.to_string(),
        message: "no input value to consume".to_string(),
    }
}

impl<T> Flow<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn wrap(node: Arc<FlowNode>) -> Self {
        Flow {
            node,
            _marker: PhantomData,
        }
    }

    /// A flow producing a constant.
    pub fn value(value: &T) -> Result<Self> {
        let value = serde_json::to_string(value)?;
        Ok(Self::wrap(FlowNode::new(NodeKind::Value { value })))
    }

    /// A constant that is produced only after `delay` has elapsed.
    pub fn delayed_value(value: &T, delay: Duration) -> Result<Self> {
        let value = serde_json::to_string(value)?;
        Ok(Self::wrap(FlowNode::new(NodeKind::DelayedValue {
            value,
            delay,
        })))
    }

    /// A flow that suspends until an external caller invokes `call_type`
    /// with a serialized `T`.
    pub fn from_call(call_type: &str) -> Self {
        Self::wrap(FlowNode::new(NodeKind::Call {
            call_type: call_type.to_string(),
            action: None,
        }))
    }

    /// Like [`from_call`](Flow::from_call), with an action that runs when
    /// the step activates (fire the request whose answer completes it).
    pub fn from_call_with<F>(call_type: &str, action: F) -> Self
    where
        F: Fn(&mut ContextStack, Option<String>) -> Result<(), FlowError>
            + Send
            + Sync
            + 'static,
    {
        Self::wrap(FlowNode::new(NodeKind::Call {
            call_type: call_type.to_string(),
            action: Some(Arc::new(action)),
        }))
    }

    /// Transform the produced value. The closure sees the trace state and
    /// the deserialized input.
    pub fn map<U, F>(self, f: F) -> Flow<U>
    where
        U: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(&mut ContextStack, T) -> Result<U, FlowError> + Send + Sync + 'static,
    {
        let erased: MapFn = Arc::new(move |cx, raw| {
            let raw = raw.ok_or_else(|| missing_input("map"))?;
            let input: T = serde_json::from_str(&raw)?;
            let output = f(cx, input)?;
            Ok(serde_json::to_string(&output)?)
        });
        Flow::wrap(FlowNode::new(NodeKind::Map {
            source: self.node,
            f: erased,
        }))
    }

    /// Continue with a flow chosen from the produced value. The sub-flow
    /// is built and wired on every traversal, scoped under this node, and
    /// rejoins the outer chain where this node's successor would run.
    pub fn then<U, F>(self, f: F) -> Flow<U>
    where
        U: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(&mut ContextStack, T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
    {
        let erased: BindFn = Arc::new(move |cx, raw| {
            let raw = raw.ok_or_else(|| missing_input("then"))?;
            let input: T = serde_json::from_str(&raw)?;
            let sub = f(cx, input)?;
            Ok(sub.node)
        });
        Flow::wrap(FlowNode::new(NodeKind::Bind {
            source: self.node,
            f: erased,
        }))
    }

    /// Explicit functional id. Required in strict-id engines; settable
    /// once.
    pub fn named(self, id: &str) -> Result<Self, BuildError> {
        if self.node.id.set(id.to_string()).is_err() {
            let current = self.node.id.get().map(String::as_str).unwrap_or_default();
            if current != id {
                return Err(BuildError::IdAlreadySet(format!(
                    "{current} (rejected {id})"
                )));
            }
        }
        Ok(self)
    }

    /// Human-facing name, searchable through frame inspection.
    pub fn display(self, name: &str) -> Self {
        if let Ok(mut display) = self.node.display_name.write() {
            *display = Some(name.to_string());
        }
        self
    }

    /// Mark this node safe to retry off its pinned host when the pin is
    /// unreachable.
    pub fn unpin_safe(self) -> Self {
        self.node.unpin_safe.store(true, Ordering::SeqCst);
        self
    }

    /// Replace a failure of this node with a recovery value; the flow
    /// proceeds as if the node produced it.
    pub fn on_error<F>(self, f: F) -> Self
    where
        F: Fn(&mut ContextStack, &str) -> Result<T, FlowError> + Send + Sync + 'static,
    {
        let erased: RecoverFn = Arc::new(move |cx, message| {
            let value = f(cx, message)?;
            Ok(serde_json::to_string(&value)?)
        });
        if let Ok(mut recover) = self.node.recover.write() {
            *recover = Some(erased);
        }
        self
    }

    /// Fixed mock result used when a test-mode engine runs a mocked trace.
    pub fn mock_value(self, value: &T) -> Result<Self> {
        let raw = serde_json::to_string(value)?;
        let erased: MockFn = Arc::new(move |_cx, _raw| Ok(raw.clone()));
        if let Ok(mut mock) = self.node.mock.write() {
            *mock = Some(erased);
        }
        Ok(self)
    }

    /// Computed mock used when a test-mode engine runs a mocked trace.
    pub fn mock_with<F>(self, f: F) -> Self
    where
        F: Fn(&mut ContextStack, Option<String>) -> Result<T, FlowError> + Send + Sync + 'static,
    {
        let erased: MockFn = Arc::new(move |cx, raw| {
            let value = f(cx, raw)?;
            Ok(serde_json::to_string(&value)?)
        });
        if let Ok(mut mock) = self.node.mock.write() {
            *mock = Some(erased);
        }
        self
    }

    /// Register this flow's whole graph with the engine under `pipeline`.
    /// Idempotent across processes building the same graph; a second init
    /// of the same handle is a build error.
    pub async fn init(&self, engine: &Engine, pipeline: &str) -> Result<PipelineInfo> {
        if self.node.inited.swap(true, Ordering::SeqCst) {
            return Err(BuildError::AlreadyInited(pipeline.to_string()).into());
        }
        let mut walk = InitWalk::new(engine, pipeline);
        let out = walk.walk(&self.node, None, None)?;
        let mut entries = walk.entries;

        // The pipeline name doubles as the entry that launches traces at
        // the head.
        engine.claim_call_type(pipeline, &out.head)?;
        engine.register_entry(
            entry_key(pipeline, &out.head),
            EntryTarget::Head {
                step_id: out.head.clone(),
            },
        );
        if entries
            .insert(pipeline.to_string(), Entry::new(pipeline, out.head.clone()))
            .is_some()
        {
            return Err(BuildError::EntryCollision(pipeline.to_string()).into());
        }

        engine.track_pipeline(pipeline).await?;
        Ok(PipelineInfo {
            pipeline: pipeline.to_string(),
            head: out.head,
            tail: out.step_id,
            entries,
        })
    }
}

/// Fan-in constructors live apart from the typed impl because their
/// branches are erased.
impl Flow<Vec<serde_json::Value>> {
    /// Run every branch as its own trace and continue with all results,
    /// in branch order, once the last arrives.
    pub fn zip(branches: Vec<AnyFlow>) -> Self {
        Flow::wrap(FlowNode::new(NodeKind::FanIn {
            mode: FanInMode::Zip,
            branches: branches.into_iter().map(|b| b.node).collect(),
            combiner: None,
            judger: None,
        }))
    }
}

impl Flow<serde_json::Value> {
    /// Run every branch as its own trace and continue with the first
    /// clean result.
    pub fn race(branches: Vec<AnyFlow>) -> Self {
        Flow::wrap(FlowNode::new(NodeKind::FanIn {
            mode: FanInMode::Race,
            branches: branches.into_iter().map(|b| b.node).collect(),
            combiner: None,
            judger: None,
        }))
    }
}

impl<T> Flow<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// [`zip`](Flow::zip) with a combiner applied to the collected branch
    /// results (absent entries are failed or missing branches).
    pub fn zip_with<F>(branches: Vec<AnyFlow>, combiner: F) -> Self
    where
        F: Fn(&mut ContextStack, Vec<Option<serde_json::Value>>) -> Result<T, FlowError>
            + Send
            + Sync
            + 'static,
    {
        let erased: ZipFn = Arc::new(move |cx, raws| {
            let mut values = Vec::with_capacity(raws.len());
            for raw in raws {
                values.push(match raw {
                    Some(raw) => Some(serde_json::from_str(&raw)?),
                    None => None,
                });
            }
            let out = combiner(cx, values)?;
            Ok(serde_json::to_string(&out)?)
        });
        Flow::wrap(FlowNode::new(NodeKind::FanIn {
            mode: FanInMode::Zip,
            branches: branches.into_iter().map(|b| b.node).collect(),
            combiner: Some(erased),
            judger: None,
        }))
    }

    /// [`race`](Flow::race) with a judger applied to the winning value
    /// and its branch index.
    pub fn race_with<W, F>(branches: Vec<AnyFlow>, judger: F) -> Self
    where
        W: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&mut ContextStack, W, usize) -> Result<T, FlowError> + Send + Sync + 'static,
    {
        let erased: RaceFn = Arc::new(move |cx, winner: RaceResult| {
            let value: W = serde_json::from_str(&winner.value)?;
            let out = judger(cx, value, winner.index)?;
            Ok(serde_json::to_string(&out)?)
        });
        Flow::wrap(FlowNode::new(NodeKind::FanIn {
            mode: FanInMode::Race,
            branches: branches.into_iter().map(|b| b.node).collect(),
            combiner: None,
            judger: Some(erased),
        }))
    }

    /// Actions run on the parent trace right after a fan-in forks its
    /// branches (kick the external systems the branches wait on). A
    /// no-op on other node kinds.
    pub fn with_triggers<F>(self, triggers: Vec<F>) -> Self
    where
        F: Fn(&mut ContextStack) -> Result<(), FlowError> + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.node.triggers.write() {
            *slot = triggers
                .into_iter()
                .map(|t| Arc::new(t) as TriggerFn)
                .collect();
        }
        self
    }
}

impl Flow<Vec<Option<serde_json::Value>>> {
    /// N external call types aggregated into one step: with `and_merge`
    /// the step waits for every entry, otherwise the first one resolves
    /// it.
    pub fn from_calls(call_types: Vec<String>, and_merge: bool) -> Self {
        Flow::wrap(FlowNode::new(NodeKind::MultiCall {
            call_types,
            and_merge,
            action: None,
        }))
    }

    /// [`from_calls`](Flow::from_calls) with an activation action.
    pub fn from_calls_with<F>(call_types: Vec<String>, and_merge: bool, action: F) -> Self
    where
        F: Fn(&mut ContextStack, Option<String>) -> Result<(), FlowError>
            + Send
            + Sync
            + 'static,
    {
        Flow::wrap(FlowNode::new(NodeKind::MultiCall {
            call_types,
            and_merge,
            action: Some(Arc::new(action)),
        }))
    }
}

/// What one pipeline init produced: the registered boundary of the graph.
#[derive(Debug, Clone)]
pub struct PipelineInfo {
    pub pipeline: String,
    /// Step activated when the pipeline launches.
    pub head: String,
    /// Step id of the graph's final node.
    pub tail: String,
    entries: HashMap<String, Entry>,
}

impl PipelineInfo {
    pub fn entry(&self, call_type: &str) -> Option<&Entry> {
        self.entries.get(call_type)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Combine the boundaries of several inited pipelines into one
    /// surface. Call types must stay unique across them.
    pub fn merge(mut self, other: PipelineInfo) -> Result<PipelineInfo, BuildError> {
        for (call_type, entry) in other.entries {
            if self.entries.insert(call_type.clone(), entry).is_some() {
                return Err(BuildError::EntryCollision(call_type));
            }
        }
        Ok(self)
    }

    /// Start (or re-enter) a trace at this pipeline's head.
    pub async fn launch(
        &self,
        engine: &Engine,
        trace_id: &str,
        payload: Option<String>,
    ) -> Result<()> {
        engine.entry_call(&self.pipeline, trace_id, payload).await
    }
}

struct WalkOut {
    /// Activation target for the walked sub-chain.
    head: String,
    /// Step id of the walked node itself.
    step_id: String,
}

/// Deterministic registration walk. Starts at the node the user holds
/// (the tail) and recurses up through sources, so successors exist before
/// the ids that embed them.
struct InitWalk<'a> {
    engine: &'a Engine,
    pipeline: String,
    seq: u32,
    entries: HashMap<String, Entry>,
}

impl<'a> InitWalk<'a> {
    fn new(engine: &'a Engine, pipeline: &str) -> Self {
        InitWalk {
            engine,
            pipeline: pipeline.to_string(),
            seq: 0,
            entries: HashMap::new(),
        }
    }

    fn functional_for(
        &mut self,
        node: &FlowNode,
        parent: Option<&str>,
        arity: Option<usize>,
    ) -> Result<String, BuildError> {
        let local = match node.id.get() {
            Some(id) => id.clone(),
            None if self.engine.config().strict_ids => {
                return Err(BuildError::MissingId(format!(
                    "unnamed {} node in pipeline {}",
                    node.kind.describe(),
                    self.pipeline
                )));
            }
            None => {
                self.seq += 1;
                format!("auto{}", self.seq)
            }
        };
        let local = match arity {
            Some(n) => format!("{local}${n}"),
            None => local,
        };
        Ok(match parent {
            Some(parent) => format!("{parent}/{local}"),
            None => local,
        })
    }

    fn descriptor(
        &self,
        node: &FlowNode,
        functional: &str,
        next: Option<String>,
        parent: Option<&str>,
    ) -> StepDescriptor {
        StepDescriptor {
            functional: functional.to_string(),
            step_id: StepDescriptor::compose_id(functional, next.as_deref()),
            next,
            parent: parent.map(str::to_string),
            pipeline: self.pipeline.clone(),
            display_name: node.display_name(),
            unpin_safe: node.unpin_safe.load(Ordering::SeqCst),
            mock: node.mock_fn(),
            recover: node.recover_fn(),
        }
    }

    fn add_entry(&mut self, call_type: &str, node_step_id: &str) -> Result<(), BuildError> {
        self.engine.claim_call_type(call_type, node_step_id)?;
        if let Some(existing) = self
            .entries
            .insert(call_type.to_string(), Entry::new(call_type, node_step_id))
        {
            if existing.node_id() != node_step_id {
                return Err(BuildError::EntryCollision(call_type.to_string()));
            }
        }
        Ok(())
    }

    fn walk(
        &mut self,
        node: &Arc<FlowNode>,
        next: Option<String>,
        parent: Option<&str>,
    ) -> Result<WalkOut, FlowError> {
        match &node.kind {
            NodeKind::Value { value } => {
                let functional = self.functional_for(node, parent, None)?;
                let desc = self.descriptor(node, &functional, next, parent);
                let step_id = desc.step_id.clone();
                self.engine
                    .register_step(Arc::new(ValueStep::new(desc, value.clone())))?;
                Ok(WalkOut {
                    head: step_id.clone(),
                    step_id,
                })
            }
            NodeKind::DelayedValue { value, delay } => {
                let functional = self.functional_for(node, parent, None)?;
                let desc = self.descriptor(node, &functional, next, parent);
                let step_id = desc.step_id.clone();
                self.engine
                    .register_step(Arc::new(DelayStep::new(desc, value.clone(), *delay)))?;
                Ok(WalkOut {
                    head: step_id.clone(),
                    step_id,
                })
            }
            NodeKind::Map { source, f } => {
                let functional = self.functional_for(node, parent, None)?;
                let desc = self.descriptor(node, &functional, next, parent);
                let step_id = desc.step_id.clone();
                self.engine
                    .register_step(Arc::new(MapStep::new(desc, f.clone())))?;
                let source = self.walk(source, Some(step_id.clone()), parent)?;
                Ok(WalkOut {
                    head: source.head,
                    step_id,
                })
            }
            NodeKind::Bind { source, f } => {
                let functional = self.functional_for(node, parent, None)?;
                let desc = self.descriptor(node, &functional, next, parent);
                let step_id = desc.step_id.clone();
                self.engine
                    .register_step(Arc::new(BindStep::new(desc, f.clone())))?;
                let source = self.walk(source, Some(step_id.clone()), parent)?;
                Ok(WalkOut {
                    head: source.head,
                    step_id,
                })
            }
            NodeKind::Call { call_type, action } => {
                let functional = self.functional_for(node, parent, None)?;
                let desc = self.descriptor(node, &functional, next, parent);
                let step_id = desc.step_id.clone();
                self.add_entry(call_type, &step_id)?;
                self.engine.register_entry(
                    entry_key(call_type, &step_id),
                    EntryTarget::Deliver {
                        step_id: step_id.clone(),
                        index: 0,
                    },
                );
                self.engine.register_step(Arc::new(CallStep::new(
                    desc,
                    call_type.clone(),
                    action.clone(),
                )))?;
                Ok(WalkOut {
                    head: step_id.clone(),
                    step_id,
                })
            }
            NodeKind::MultiCall {
                call_types,
                and_merge,
                action,
            } => {
                let functional = self.functional_for(node, parent, None)?;
                let desc = self.descriptor(node, &functional, next, parent);
                let step_id = desc.step_id.clone();
                for (index, call_type) in call_types.iter().enumerate() {
                    self.add_entry(call_type, &step_id)?;
                    self.engine.register_entry(
                        entry_key(call_type, &step_id),
                        EntryTarget::Deliver {
                            step_id: step_id.clone(),
                            index,
                        },
                    );
                }
                self.engine.register_step(Arc::new(MultiCallStep::new(
                    desc,
                    call_types.clone(),
                    *and_merge,
                    action.clone(),
                )))?;
                Ok(WalkOut {
                    head: step_id.clone(),
                    step_id,
                })
            }
            NodeKind::FanIn {
                mode,
                branches,
                combiner,
                judger,
            } => self.walk_fan_in(
                node,
                *mode,
                branches,
                combiner.clone(),
                judger.clone(),
                next,
                parent,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_fan_in(
        &mut self,
        node: &Arc<FlowNode>,
        mode: FanInMode,
        branches: &[Arc<FlowNode>],
        combiner: Option<ZipFn>,
        judger: Option<RaceFn>,
        next: Option<String>,
        parent: Option<&str>,
    ) -> Result<WalkOut, FlowError> {
        let arity = branches.len();
        if arity == 0 {
            return Err(BuildError::ArityMismatch {
                expected: 1,
                actual: 0,
            }
            .into());
        }
        let functional = self.functional_for(node, parent, Some(arity))?;

        // Internal collect: where results meet the user again. It carries
        // the fan-in node's recovery so branch failures surface there.
        let collect_functional = format!("{functional}/collect");
        let collect_id =
            StepDescriptor::compose_id(&collect_functional, next.as_deref());
        let collect_desc = StepDescriptor {
            functional: collect_functional,
            step_id: collect_id.clone(),
            next: next.clone(),
            parent: Some(functional.clone()),
            pipeline: self.pipeline.clone(),
            display_name: None,
            unpin_safe: false,
            mock: None,
            recover: node.recover_fn(),
        };
        self.engine.register_step(Arc::new(CollectStep::new(
            collect_desc,
            mode,
            arity,
            combiner,
            judger,
        )))?;

        // Internal join: one sub-entry per branch.
        let join_functional = format!("{functional}/join");
        let join_id = StepDescriptor::compose_id(&join_functional, Some(&collect_id));
        let call_types: Vec<String> =
            (0..arity).map(|i| format!("{functional}/b{i}")).collect();
        let join_desc = StepDescriptor {
            functional: join_functional,
            step_id: join_id.clone(),
            next: Some(collect_id.clone()),
            parent: Some(functional.clone()),
            pipeline: self.pipeline.clone(),
            display_name: None,
            unpin_safe: false,
            mock: None,
            recover: None,
        };
        for (index, call_type) in call_types.iter().enumerate() {
            self.add_entry(call_type, &join_id)?;
            self.engine.register_entry(
                entry_key(call_type, &join_id),
                EntryTarget::Deliver {
                    step_id: join_id.clone(),
                    index,
                },
            );
        }
        self.engine.register_step(Arc::new(MultiCallStep::new(
            join_desc,
            call_types.clone(),
            matches!(mode, FanInMode::Zip),
            None,
        )))?;

        // Per-branch post steps and the branch chains feeding them.
        let mut branch_heads = Vec::with_capacity(arity);
        for (index, branch) in branches.iter().enumerate() {
            let post_functional = format!("{functional}/post{index}");
            let post_id = StepDescriptor::compose_id(&post_functional, None);
            let post_desc = StepDescriptor {
                functional: post_functional,
                step_id: post_id.clone(),
                next: None,
                parent: Some(functional.clone()),
                pipeline: self.pipeline.clone(),
                display_name: None,
                unpin_safe: false,
                mock: None,
                recover: None,
            };
            let gather = GatherPost {
                call_type: call_types[index].clone(),
                node: join_id.clone(),
                index,
            };
            self.engine
                .register_step(Arc::new(PostStep::new(post_desc, gather)))?;

            let out = self.walk(branch, Some(post_id), Some(&functional))?;
            branch_heads.push(out.head);
        }

        let desc = StepDescriptor {
            functional: functional.clone(),
            step_id: StepDescriptor::compose_id(&functional, next.as_deref()),
            next: Some(join_id.clone()),
            parent: parent.map(str::to_string),
            pipeline: self.pipeline.clone(),
            display_name: node.display_name(),
            unpin_safe: node.unpin_safe.load(Ordering::SeqCst),
            mock: node.mock_fn(),
            recover: node.recover_fn(),
        };
        let step_id = desc.step_id.clone();
        self.engine.register_step(Arc::new(ZipStep::new(
            desc,
            join_id,
            call_types,
            branch_heads,
            node.trigger_fns(),
        )))?;
        Ok(WalkOut {
            head: step_id.clone(),
            step_id,
        })
    }
}

/// Wire a bind's sub-graph at traversal time: scoped under the binder,
/// rejoining the outer chain at the binder's successor. Registration is
/// shape-idempotent, so loops traverse freely.
pub(crate) fn init_sub_chain(
    engine: &Engine,
    node: &Arc<FlowNode>,
    pipeline: &str,
    next: Option<String>,
    parent: &str,
) -> Result<String, FlowError> {
    let mut walk = InitWalk::new(engine, pipeline);
    let out = walk.walk(node, next, Some(parent))?;
    Ok(out.head)
}
