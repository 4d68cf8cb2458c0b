//! The dispatch protocol: how activations, completions, and failures move
//! a trace through its registered steps.
//!
//! Delivery is at least once, so every hand-off is pre-announced in the
//! trace state (`next_step`) before it is published, and every receipt is
//! guarded: finished traces, duplicate activations, stale activations,
//! and halted frames all drop the message instead of re-running work.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::channel::{StepMessage, TransferHop, TRANSFER_CALL_TYPE};
use crate::context::{ContextStack, FrameStatus};
use crate::engine::{backlog_key, Engine, FlowEvent};
use crate::error::{FlowError, Result};
use crate::step::{FlowStep, StepOutcome, BRANCH_ERROR_PREFIX};
use crate::store::{ContextStore, GlobalStore};

impl Engine {
    /// Hand `trace_id` to `step_id`. Pinned traces and non-async engines
    /// dispatch in-process; otherwise the hand-off rides the channel and
    /// any subscriber may pick it up.
    pub(crate) async fn activate(
        &self,
        trace_id: &str,
        step_id: &str,
        payload: Option<String>,
        stack_len: usize,
        pinned: bool,
    ) -> Result<()> {
        if pinned || !self.config().deliver_async || !self.is_started() {
            return self.call_step(trace_id, step_id, payload).await;
        }
        let mut message = StepMessage::activation(trace_id, step_id, stack_len);
        message.payload = payload;
        if let Err(err) = self.inner.channel.send(message).await {
            // The hand-off is lost until an operator replays it.
            self.global_error(
                Some(trace_id),
                "channel",
                &format!("activation publish for {step_id} failed: {err}"),
            )
            .await;
        }
        Ok(())
    }

    /// Run one step against a trace, applying the delivery guards in
    /// order before any work happens.
    ///
    /// Boxed because dispatch recurses (`call_step` -> `trigger_next` ->
    /// `activate` -> `call_step`); the explicit `BoxFuture` breaks the
    /// cycle for both future size and `Send` inference.
    pub(crate) fn call_step<'a>(
        &'a self,
        trace_id: &'a str,
        step_id: &'a str,
        payload: Option<String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.is_omitted(step_id) {
                debug!("{step_id} is omitted, dropping activation for {trace_id}");
                return Ok(());
            }
            let Some(step) = self.step(step_id) else {
                return Err(FlowError::NotInited(step_id.to_string()));
            };

            let mut retry_param = None;
            let mut cx = match self.load_cx(trace_id).await? {
                Some(mut cx) => {
                    if cx.finished {
                        debug!("trace {trace_id} is finished, dropping {step_id}");
                        return Ok(());
                    }
                    if let Some(top) = cx.top() {
                        if top.name == step_id && top.status == FrameStatus::Begin {
                            debug!("duplicate activation of {step_id} on {trace_id} dropped");
                            return Ok(());
                        }
                        if top.status == FrameStatus::Error {
                            debug!(
                                "trace {trace_id} is halted at {}, dropping {step_id}",
                                top.name
                            );
                            return Ok(());
                        }
                    }
                    if cx.next_step.as_deref() != Some(step_id) && !self.follows_top(&cx, step_id) {
                        debug!(
                            "stale activation of {step_id} on {trace_id} (trace moved to {:?})",
                            cx.next_step
                        );
                        return Ok(());
                    }
                    if let Some(top) = cx.top() {
                        if top.name == step_id && matches!(top.status, FrameStatus::Retry(_)) {
                            // A retry attempt reuses the original input.
                            retry_param = top.param.clone();
                            cx.stack.pop();
                        }
                    }
                    cx
                }
                None => ContextStack::new(trace_id),
            };

            self.inner.global_store.incr(&backlog_key(step_id)).await?;
            let desc = step.descriptor();
            cx.begin_frame(step_id, desc.display_name.clone(), self.host_ip());
            let incoming = payload.or(retry_param);
            if incoming.is_some() {
                if let Some(top) = cx.top_mut() {
                    top.param = incoming;
                }
            }
            self.persist_cx(&cx).await?;
            self.emit(FlowEvent::StepStarted {
                trace_id: trace_id.to_string(),
                step_id: step_id.to_string(),
            });

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
            self.handle_outcome(&step, &mut cx, result).await
        })
    }

    /// Fallback staleness check: an activation with no matching
    /// announcement is still legitimate when the top frame's registered
    /// successor is the activated step.
    fn follows_top(&self, cx: &ContextStack, step_id: &str) -> bool {
        let Some(top) = cx.top() else {
            return cx.next_step.is_none();
        };
        self.step(&top.name)
            .and_then(|s| s.descriptor().next.clone())
            .as_deref()
            == Some(step_id)
    }

    pub(crate) async fn handle_outcome(
        &self,
        step: &Arc<dyn FlowStep>,
        cx: &mut ContextStack,
        result: Result<StepOutcome>,
    ) -> Result<()> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => StepOutcome::from_error(err),
        };
        let step_id = step.descriptor().step_id.clone();
        match outcome {
            StepOutcome::Continue(value) => self.complete_step_cx(cx, &step_id, value).await,
            StepOutcome::Suspend => self.persist_cx(cx).await,
            StepOutcome::Routed => Ok(()),
            StepOutcome::Terminate => {
                cx.end_top(None);
                self.inner.global_store.decr(&backlog_key(&step_id)).await?;
                debug!("trace {} terminated at {step_id}", cx.id);
                self.finish_trace(cx).await
            }
            StepOutcome::SubflowDone => {
                cx.end_top(None);
                self.inner.global_store.decr(&backlog_key(&step_id)).await?;
                self.finish_trace(cx).await
            }
            StepOutcome::Retry(reason) => {
                cx.set_top_status(FrameStatus::Retry(reason.clone()));
                self.inner.global_store.decr(&backlog_key(&step_id)).await?;
                self.persist_cx(cx).await?;
                self.emit(FlowEvent::StepRetrying {
                    trace_id: cx.id.clone(),
                    step_id,
                    reason: reason.clone(),
                });
                Err(FlowError::Retry(reason))
            }
            StepOutcome::Failed(err) => self.fail_step(step, cx, err).await,
        }
    }

    /// Close the top frame with a result and hand the trace onward.
    pub(crate) async fn complete_step_cx(
        &self,
        cx: &mut ContextStack,
        step_id: &str,
        result: Option<String>,
    ) -> Result<()> {
        cx.end_top(result);
        self.inner.global_store.decr(&backlog_key(step_id)).await?;
        let duration_ms = cx.top().and_then(|f| f.cost_ms).unwrap_or(0);
        self.emit(FlowEvent::StepCompleted {
            trace_id: cx.id.clone(),
            step_id: step_id.to_string(),
            duration_ms,
        });
        // Ephemeral replay runs the one step and stops: the persisted
        // trace must not advance.
        if cx.no_storage {
            return Ok(());
        }
        self.trigger_next(cx, step_id).await
    }

    /// Complete a suspended step from outside the dispatcher (external
    /// callbacks, fan-in resolution). Idempotent: completions for frames
    /// that already closed, or that the trace moved past, are dropped.
    pub async fn complete_step(
        &self,
        trace_id: &str,
        step_id: &str,
        result: Option<String>,
    ) -> Result<()> {
        let Some(mut cx) = self.load_cx(trace_id).await? else {
            return Err(FlowError::Retry(format!(
                "no state for trace {trace_id} completing {step_id}"
            )));
        };
        if cx.finished {
            debug!("completion of {step_id} on finished trace {trace_id} dropped");
            return Ok(());
        }
        match cx.top() {
            Some(top) if top.name == step_id && top.status == FrameStatus::Begin => {
                self.complete_step_cx(&mut cx, step_id, result).await
            }
            Some(top) if top.name == step_id => {
                debug!("repeat completion of {step_id} on {trace_id} dropped");
                Ok(())
            }
            _ => {
                debug!("stale completion of {step_id} on {trace_id} dropped");
                Ok(())
            }
        }
    }

    /// Advance past a completed step: announce the successor, persist the
    /// hand-off, then activate. Terminal steps finish the trace.
    pub(crate) async fn trigger_next(&self, cx: &mut ContextStack, step_id: &str) -> Result<()> {
        let next = self.step(step_id).and_then(|s| s.descriptor().next.clone());
        let Some(next_id) = next else {
            return self.finish_trace(cx).await;
        };
        cx.next_step = Some(next_id.clone());
        self.persist_cx(cx).await?;
        self.activate(&cx.id, &next_id, None, cx.stack.len(), cx.local)
            .await
    }

    pub(crate) async fn finish_trace(&self, cx: &mut ContextStack) -> Result<()> {
        cx.finished = true;
        cx.next_step = None;
        self.persist_cx(cx).await?;
        // Forked branches stay loadable after they finish: the parent's
        // collect reads their journals once the join resolves. The store
        // reclaims them by TTL instead.
        if cx.parent_trace.is_none() {
            self.inner.context_store.expire(&cx.id).await?;
        }
        self.emit(FlowEvent::TraceFinished {
            trace_id: cx.id.clone(),
        });
        Ok(())
    }

    /// A step failed for real. Recovery (when attached) replaces the
    /// result and the flow proceeds; otherwise the trace halts where it
    /// stands. Forked branches are the exception: their join would wait
    /// forever, so the failure is reported there before the branch ends.
    pub(crate) async fn fail_step(
        &self,
        step: &Arc<dyn FlowStep>,
        cx: &mut ContextStack,
        err: FlowError,
    ) -> Result<()> {
        let desc = step.descriptor();
        let message = err.to_string();
        warn!("step {} failed on {}: {message}", desc.step_id, cx.id);
        cx.append_error("step", &message);
        cx.set_top_status(FrameStatus::Error);
        // Error handling may touch process-local state; keep the trace here.
        cx.local = true;
        self.inner
            .global_store
            .decr(&backlog_key(&desc.step_id))
            .await?;
        self.emit(FlowEvent::StepFailed {
            trace_id: cx.id.clone(),
            step_id: desc.step_id.clone(),
            error: message.clone(),
        });

        let recovered = match &desc.recover {
            Some(recover) => match recover(cx, &message) {
                Ok(value) => Some(value),
                Err(recover_err) => {
                    warn!(
                        "recovery for {} failed on {}: {recover_err}",
                        desc.step_id, cx.id
                    );
                    cx.append_error("recover", &recover_err.to_string());
                    None
                }
            },
            None => None,
        };

        match recovered {
            Some(value) => {
                // The halted frame stays in the journal; the recovery's
                // value continues the flow in a fresh frame.
                self.inner
                    .global_store
                    .incr(&backlog_key(&desc.step_id))
                    .await?;
                cx.begin_frame(&desc.step_id, desc.display_name.clone(), self.host_ip());
                self.complete_step_cx(cx, &desc.step_id, Some(value)).await
            }
            None => self.halt_or_report(cx, &message).await,
        }
    }

    async fn halt_or_report(&self, cx: &mut ContextStack, message: &str) -> Result<()> {
        let report = match (&cx.parent_trace, &cx.gather) {
            (Some(parent), Some(gather)) => Some((parent.clone(), gather.clone())),
            _ => None,
        };
        let Some((parent, gather)) = report else {
            // Halt in place: the journal keeps the error frame for
            // inspection and replay.
            self.persist_cx(cx).await?;
            return Ok(());
        };
        self.persist_cx(cx).await?;
        let sentinel = format!("{BRANCH_ERROR_PREFIX}{message}");
        match self.step(&gather.node) {
            Some(join) => {
                if let Err(post_err) = join
                    .deliver(self, &parent, gather.index, Some(sentinel))
                    .await
                {
                    self.global_error(
                        Some(&parent),
                        "branch",
                        &format!("branch {} could not report its failure: {post_err}", cx.id),
                    )
                    .await;
                }
            }
            None => {
                self.global_error(
                    Some(&parent),
                    "branch",
                    &format!("join {} missing for failed branch {}", gather.node, cx.id),
                )
                .await;
            }
        }
        self.finish_trace(cx).await
    }

    /// Channel subscriber entry point. Retryable errors propagate so the
    /// transport redelivers; anything else is recorded and swallowed so
    /// the message is consumed.
    pub(crate) async fn handle_message(&self, message: StepMessage) -> Result<()> {
        match self.dispatch_message(&message).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => {
                warn!(
                    "message {} for {} will be redelivered: {err}",
                    message.message_id, message.trace_id
                );
                Err(err)
            }
            Err(err) => {
                self.global_error(Some(&message.trace_id), "dispatch", &err.to_string())
                    .await;
                Ok(())
            }
        }
    }

    async fn dispatch_message(&self, message: &StepMessage) -> Result<()> {
        if let Some(call_type) = &message.call_type {
            return self
                .receive_transfer(call_type, &message.trace_id, message.payload.clone())
                .await;
        }
        let Some(step_id) = &message.step_id else {
            return Err(FlowError::Channel(format!(
                "message {} names neither step nor call type",
                message.message_id
            )));
        };

        // Locality: a pinned trace picked up by the wrong process goes
        // back to its host.
        if let Some(cx) = self.load_cx(&message.trace_id).await? {
            if let Some(pin) = cx.pinned_ip().map(str::to_string) {
                if pin != self.host_ip() {
                    return self.transfer_activation(&pin, step_id, message).await;
                }
            }
        }

        if self.step(step_id).is_none() {
            // Partial deployment: another process may host this step.
            return self.forward_activation(step_id, message).await;
        }
        self.call_step(&message.trace_id, step_id, message.payload.clone())
            .await
    }

    async fn transfer_activation(
        &self,
        pin: &str,
        step_id: &str,
        message: &StepMessage,
    ) -> Result<()> {
        let hop = serde_json::to_string(&TransferHop {
            step_id: step_id.to_string(),
            payload: message.payload.clone(),
        })?;
        match self
            .resend(pin, TRANSFER_CALL_TYPE, &message.trace_id, Some(hop))
            .await
        {
            Ok(()) => {
                self.emit(FlowEvent::TraceTransferred {
                    trace_id: message.trace_id.clone(),
                    target_ip: pin.to_string(),
                });
                Ok(())
            }
            Err(err) => {
                let unpin_ok = self
                    .step(step_id)
                    .map(|s| s.descriptor().unpin_safe)
                    .unwrap_or(false);
                if !unpin_ok {
                    return Err(FlowError::Retry(format!(
                        "pinned host {pin} unreachable for {}: {err}",
                        message.trace_id
                    )));
                }
                warn!(
                    "pinned host {pin} unreachable for {}, unpinning: {err}",
                    message.trace_id
                );
                if let Some(mut cx) = self.load_cx(&message.trace_id).await? {
                    cx.local = false;
                    self.persist_cx(&cx).await?;
                }
                self.call_step(&message.trace_id, step_id, message.payload.clone())
                    .await
            }
        }
    }

    async fn forward_activation(&self, step_id: &str, message: &StepMessage) -> Result<()> {
        let hop = serde_json::to_string(&TransferHop {
            step_id: step_id.to_string(),
            payload: message.payload.clone(),
        })?;
        let hosts = self.inner.global_store.host_ips().await?;
        for ip in hosts.iter().filter(|ip| ip.as_str() != self.host_ip()) {
            if self
                .resend(ip, TRANSFER_CALL_TYPE, &message.trace_id, Some(hop.clone()))
                .await
                .is_ok()
            {
                self.emit(FlowEvent::TraceTransferred {
                    trace_id: message.trace_id.clone(),
                    target_ip: ip.clone(),
                });
                return Ok(());
            }
        }
        Err(FlowError::NotInited(step_id.to_string()))
    }

    /// Serve a call another process forwarded here after deciding this
    /// host owns the trace or the step.
    pub async fn receive_transfer(
        &self,
        call_type: &str,
        trace_id: &str,
        payload: Option<String>,
    ) -> Result<()> {
        if call_type == TRANSFER_CALL_TYPE {
            let Some(raw) = payload else {
                return Err(FlowError::Channel(
                    "transfer without activation payload".to_string(),
                ));
            };
            let hop: TransferHop = serde_json::from_str(&raw)?;
            return self.call_step(trace_id, &hop.step_id, hop.payload).await;
        }
        self.entry_call(call_type, trace_id, payload).await
    }

    /// Resumption hook for the delay scheduler.
    pub async fn resume_delayed(&self, trace_id: &str, step_id: &str) -> Result<()> {
        let Some(mut cx) = self.load_cx(trace_id).await? else {
            return Err(FlowError::Retry(format!("no state for trace {trace_id}")));
        };
        if cx.finished {
            return Ok(());
        }
        let current = matches!(
            cx.top(),
            Some(top) if top.name == step_id && top.status == FrameStatus::Begin
        );
        if !current {
            debug!("delayed resume of {step_id} on {trace_id} is stale, dropped");
            return Ok(());
        }
        let Some(step) = self.step(step_id) else {
            return Err(FlowError::NotInited(step_id.to_string()));
        };
        let result = step.resume(self, &mut cx).await;
        self.handle_outcome(&step, &mut cx, result).await
    }
}
