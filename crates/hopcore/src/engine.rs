//! The engine: shared registries, storage handles, and lifecycle.
//!
//! `Engine` is a cheap-clone handle. Step registration happens at flow
//! init time and is idempotent per shape, so every process of a cluster
//! can (re)build the same pipelines at boot and then exchange traces
//! freely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::{DashMap, DashSet};
use futures_util::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::channel::{
    DelayScheduler, MessageChannel, MessageHandler, RequestResender, TRANSFER_CALL_TYPE,
};
use crate::context::{ContextStack, Frame};
use crate::entry::EntryTarget;
use crate::error::{BuildError, FlowError, Result};
use crate::step::{FlowStep, StepOutcome, StepShape};
use crate::store::{
    ContextStore, GlobalStore, RetryPolicy, RetryingContextStore, RetryingGlobalStore,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address other processes reach this one at; recorded on every frame.
    pub host_ip: String,
    /// Require explicit node ids. Disable only for single-process graphs
    /// built in a deterministic order.
    pub strict_ids: bool,
    /// Hand traces to successors through the message channel. When off,
    /// dispatch recurses in-process (tests, single-node deployments).
    pub deliver_async: bool,
    /// Allow per-trace mock short-circuits.
    pub test_mode: bool,
    pub event_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            host_ip: "127.0.0.1".to_string(),
            strict_ids: true,
            deliver_async: true,
            test_mode: false,
            event_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_host_ip(mut self, ip: impl Into<String>) -> Self {
        self.host_ip = ip.into();
        self
    }

    pub fn with_strict_ids(mut self, strict: bool) -> Self {
        self.strict_ids = strict;
        self
    }

    pub fn with_deliver_async(mut self, async_delivery: bool) -> Self {
        self.deliver_async = async_delivery;
        self
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// SPI implementations an engine runs on.
pub struct Backends {
    pub context_store: Arc<dyn ContextStore>,
    pub global_store: Arc<dyn GlobalStore>,
    pub channel: Arc<dyn MessageChannel>,
    pub resender: Option<Arc<dyn RequestResender>>,
    pub delays: Option<Arc<dyn DelayScheduler>>,
}

/// Observability stream; mirrors the dispatch protocol's transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FlowEvent {
    StepStarted {
        trace_id: String,
        step_id: String,
    },
    StepCompleted {
        trace_id: String,
        step_id: String,
        duration_ms: i64,
    },
    StepFailed {
        trace_id: String,
        step_id: String,
        error: String,
    },
    StepRetrying {
        trace_id: String,
        step_id: String,
        reason: String,
    },
    TraceFinished {
        trace_id: String,
    },
    TraceTransferred {
        trace_id: String,
        target_ip: String,
    },
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) context_store: RetryingContextStore,
    pub(crate) global_store: RetryingGlobalStore,
    pub(crate) channel: Arc<dyn MessageChannel>,
    pub(crate) resender: Option<Arc<dyn RequestResender>>,
    pub(crate) delays: Option<Arc<dyn DelayScheduler>>,
    pub(crate) steps: DashMap<String, Arc<dyn FlowStep>>,
    pub(crate) shapes: DashMap<String, StepShape>,
    pub(crate) entries: DashMap<String, EntryTarget>,
    pub(crate) call_type_claims: DashMap<String, String>,
    pub(crate) pipelines: DashSet<String>,
    pub(crate) omit_patterns: RwLock<Vec<Regex>>,
    pub(crate) events: broadcast::Sender<FlowEvent>,
    started: AtomicBool,
}

#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig, backends: Backends) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let retry = config.retry.clone();
        Engine {
            inner: Arc::new(EngineInner {
                context_store: RetryingContextStore::new(backends.context_store, retry.clone()),
                global_store: RetryingGlobalStore::new(backends.global_store, retry),
                channel: backends.channel,
                resender: backends.resender,
                delays: backends.delays,
                steps: DashMap::new(),
                shapes: DashMap::new(),
                entries: DashMap::new(),
                call_type_claims: DashMap::new(),
                pipelines: DashSet::new(),
                omit_patterns: RwLock::new(Vec::new()),
                events,
                started: AtomicBool::new(false),
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn host_ip(&self) -> &str {
        &self.inner.config.host_ip
    }

    pub fn new_trace_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Hook this engine up to its channel. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let engine = self.clone();
        let handler: MessageHandler = Arc::new(move |message| {
            let engine = engine.clone();
            Box::pin(async move { engine.handle_message(message).await })
        });
        self.inner.channel.subscribe(handler).await
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<FlowEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: FlowEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Steps whose ids match an omit pattern are dropped at dispatch.
    pub fn add_omit_pattern(&self, pattern: &str) -> Result<()> {
        let compiled = Regex::new(pattern)
            .map_err(|e| BuildError::InvalidPattern(format!("{pattern}: {e}")))?;
        if let Ok(mut patterns) = self.inner.omit_patterns.write() {
            patterns.push(compiled);
        }
        Ok(())
    }

    pub(crate) fn is_omitted(&self, step_id: &str) -> bool {
        match self.inner.omit_patterns.read() {
            Ok(patterns) => patterns.iter().any(|p| p.is_match(step_id)),
            Err(_) => false,
        }
    }

    /// Register a step, idempotently per shape: re-registering the same id
    /// with the same structure replaces it, a different structure is a
    /// build conflict.
    pub(crate) fn register_step(&self, step: Arc<dyn FlowStep>) -> Result<(), BuildError> {
        let id = step.descriptor().step_id.clone();
        let shape = step.shape();
        if let Some(existing) = self.inner.shapes.get(&id) {
            if *existing != shape {
                return Err(BuildError::IdReused(id));
            }
            debug!("step {id} re-registered with identical shape");
        }
        self.inner.shapes.insert(id.clone(), shape);
        self.inner.steps.insert(id, step);
        Ok(())
    }

    pub(crate) fn step(&self, step_id: &str) -> Option<Arc<dyn FlowStep>> {
        self.inner.steps.get(step_id).map(|s| Arc::clone(s.value()))
    }

    pub(crate) fn claim_call_type(
        &self,
        call_type: &str,
        node_step_id: &str,
    ) -> Result<(), BuildError> {
        // The transfer channel intercepts its call type before entries
        // are consulted, so an application claim would never be served.
        if call_type == TRANSFER_CALL_TYPE {
            return Err(BuildError::ReservedCallType(call_type.to_string()));
        }
        if let Some(owner) = self.inner.call_type_claims.get(call_type) {
            if owner.value() != node_step_id {
                return Err(BuildError::CallTypeReused {
                    call_type: call_type.to_string(),
                    owner: owner.value().clone(),
                });
            }
        }
        self.inner
            .call_type_claims
            .insert(call_type.to_string(), node_step_id.to_string());
        Ok(())
    }

    pub(crate) fn register_entry(&self, key: String, target: EntryTarget) {
        self.inner.entries.insert(key, target);
    }

    pub(crate) fn entry_target(&self, key: &str) -> Option<EntryTarget> {
        self.inner.entries.get(key).map(|e| e.value().clone())
    }

    pub(crate) fn call_type_owner(&self, call_type: &str) -> Option<String> {
        self.inner
            .call_type_claims
            .get(call_type)
            .map(|o| o.value().clone())
    }

    pub(crate) async fn track_pipeline(&self, pipeline: &str) -> Result<()> {
        self.inner.pipelines.insert(pipeline.to_string());
        self.inner
            .global_store
            .keep_alive(pipeline, self.host_ip())
            .await?;
        Ok(())
    }

    /// Every pipeline this process knows is live on the same number of
    /// hosts. Gate external traffic on this after a rolling deploy.
    pub async fn cluster_ready(&self) -> Result<bool> {
        let mut expected = None;
        for pipeline in self.inner.pipelines.iter() {
            let count = self.inner.global_store.alive_count(pipeline.key()).await?;
            if count <= 0 {
                return Ok(false);
            }
            match expected {
                None => expected = Some(count),
                Some(n) if n != count => return Ok(false),
                Some(_) => {}
            }
        }
        Ok(expected.is_some())
    }

    pub(crate) async fn load_cx(&self, trace_id: &str) -> Result<Option<ContextStack>> {
        match self.inner.context_store.get(trace_id).await? {
            Some(raw) => Ok(Some(ContextStack::rebuild(&raw).map_err(store_format)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn persist_cx(&self, cx: &ContextStack) -> Result<()> {
        if cx.no_storage {
            return Ok(());
        }
        let raw = cx.dump().map_err(store_format)?;
        self.inner.context_store.put(&cx.id, &raw).await?;
        Ok(())
    }

    /// Load a trace's journaled state, if any.
    pub async fn trace_state(&self, trace_id: &str) -> Result<Option<ContextStack>> {
        self.load_cx(trace_id).await
    }

    /// Write trace state directly, bypassing dispatch. Meant for seeding
    /// fixtures and for migration tooling.
    pub async fn seed_trace(&self, cx: &ContextStack) -> Result<()> {
        let raw = cx.dump().map_err(store_format)?;
        self.inner.context_store.put(&cx.id, &raw).await?;
        Ok(())
    }

    /// Drop a trace's state outright, skipping the expire grace window.
    pub async fn purge_trace(&self, trace_id: &str) -> Result<()> {
        self.inner.context_store.remove(trace_id).await?;
        Ok(())
    }

    /// Count of begun-but-unfinished executions of one step, cluster wide.
    pub async fn step_backlog(&self, step_id: &str) -> Result<i64> {
        let raw = self
            .inner
            .global_store
            .get(&backlog_key(step_id))
            .await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Locate the most recent frame named (or displayed as) `name`,
    /// searching forked child traces too.
    pub fn find_frame<'a>(
        &'a self,
        trace_id: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<FrameLocation>>> {
        Box::pin(async move {
            let Some(cx) = self.load_cx(trace_id).await? else {
                return Ok(None);
            };
            for frame in cx.stack.iter().rev() {
                if frame_matches(frame, name) {
                    return Ok(Some(FrameLocation {
                        trace_id: trace_id.to_string(),
                        frame: frame.clone(),
                    }));
                }
            }
            for frame in cx.stack.iter().rev() {
                for child in &frame.child_tasks {
                    if let Some(found) = self.find_frame(child, name).await? {
                        return Ok(Some(found));
                    }
                }
            }
            Ok(None)
        })
    }

    /// Rewind a trace and run `step_id` again with its original input.
    pub async fn replay_step(&self, trace_id: &str, step_id: &str) -> Result<()> {
        let Some(mut cx) = self.load_cx(trace_id).await? else {
            return Err(FlowError::Retry(format!("no state for trace {trace_id}")));
        };
        let Some(frame) = cx.rewind_to(step_id) else {
            return Err(FlowError::User {
                step: step_id.to_string(),
                message: "step never ran in this trace".to_string(),
            });
        };
        cx.finished = false;
        cx.next_step = Some(step_id.to_string());
        self.persist_cx(&cx).await?;
        let stack_len = cx.stack.len();
        warn!("replaying {step_id} on trace {trace_id}");
        self.activate(trace_id, step_id, frame.param, stack_len, cx.local)
            .await
    }

    /// Run `step_id` once more against a rewound in-memory copy of the
    /// trace, with its original input. Nothing is persisted and no
    /// successor is triggered; the persisted trace stays as it was. The
    /// step's hook still runs for real (or its mock, on a mocked trace in
    /// a test-mode engine), and its recorded result is returned.
    pub async fn replay_step_ephemeral(
        &self,
        trace_id: &str,
        step_id: &str,
    ) -> Result<Option<String>> {
        let Some(mut cx) = self.load_cx(trace_id).await? else {
            return Err(FlowError::Retry(format!("no state for trace {trace_id}")));
        };
        let Some(frame) = cx.rewind_to(step_id) else {
            return Err(FlowError::User {
                step: step_id.to_string(),
                message: "step never ran in this trace".to_string(),
            });
        };
        let Some(step) = self.step(step_id) else {
            return Err(FlowError::NotInited(step_id.to_string()));
        };
        cx.no_storage = true;
        cx.finished = false;
        debug!("ephemeral replay of {step_id} on trace {trace_id}");

        self.inner.global_store.incr(&backlog_key(step_id)).await?;
        let desc = step.descriptor();
        cx.begin_frame(step_id, desc.display_name.clone(), self.host_ip());
        if frame.param.is_some() {
            if let Some(top) = cx.top_mut() {
                top.param = frame.param;
            }
        }
        let mock = if self.config().test_mode && cx.mock {
            desc.mock.clone()
        } else {
            None
        };
        let result = match mock {
            Some(mock) => {
                let param = cx.top().and_then(|f| f.param.clone());
                mock(&mut cx, param).map(|v| StepOutcome::Continue(Some(v)))
            }
            None => step.run(self, &mut cx).await,
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => StepOutcome::from_error(err),
        };
        match outcome {
            StepOutcome::Continue(value) => {
                cx.end_top(value.clone());
                self.inner.global_store.decr(&backlog_key(step_id)).await?;
                Ok(value)
            }
            // Routing steps settle their own accounting before handing
            // control back.
            StepOutcome::Routed => Ok(None),
            StepOutcome::Failed(err) => {
                self.inner.global_store.decr(&backlog_key(step_id)).await?;
                Err(err)
            }
            _ => {
                self.inner.global_store.decr(&backlog_key(step_id)).await?;
                Ok(None)
            }
        }
    }

    /// Last-resort error sink: log it, and when the trace is known, pin
    /// the failure onto its state for later inspection.
    pub async fn global_error(&self, trace_id: Option<&str>, kind: &str, message: &str) {
        error!("global error [{kind}] trace={trace_id:?}: {message}");
        let Some(trace_id) = trace_id else { return };
        match self.load_cx(trace_id).await {
            Ok(Some(mut cx)) => {
                cx.append_error(kind, message);
                if let Err(err) = self.persist_cx(&cx).await {
                    error!("could not record global error on {trace_id}: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => error!("could not load {trace_id} to record error: {err}"),
        }
    }
}

/// A located frame plus the trace (possibly a forked child) holding it.
#[derive(Debug, Clone)]
pub struct FrameLocation {
    pub trace_id: String,
    pub frame: Frame,
}

fn frame_matches(frame: &Frame, name: &str) -> bool {
    if frame.name == name || frame.display_name.as_deref() == Some(name) {
        return true;
    }
    // Functional id prefix, so callers need not spell out the successor.
    frame
        .name
        .split_once("->")
        .map(|(functional, _)| functional == name)
        .unwrap_or(false)
}

pub(crate) fn backlog_key(step_id: &str) -> String {
    format!("backlog:{step_id}")
}

// State that fails to (de)serialize at a store boundary is a store
// problem, not a serialization problem.
fn store_format(err: serde_json::Error) -> FlowError {
    FlowError::Store(crate::error::StoreError::Format(err))
}
