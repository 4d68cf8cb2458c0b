//! External entry points: named call types bound to pipeline nodes.

use tracing::{debug, warn};

use crate::engine::{Engine, FlowEvent};
use crate::error::{FlowError, Result};
use crate::store::GlobalStore;

/// How an entry invocation is applied to its owning node.
#[derive(Debug, Clone)]
pub(crate) enum EntryTarget {
    /// Start (or re-enter) a trace at a pipeline head.
    Head { step_id: String },
    /// Deliver an external payload to a suspended step (indexed for
    /// fan-in joins with multiple sub-entries).
    Deliver { step_id: String, index: usize },
}

pub(crate) fn entry_key(call_type: &str, node_step_id: &str) -> String {
    format!("{call_type}@{node_step_id}")
}

/// Invocable handle to one registered call type, as handed out by flow
/// initialization.
#[derive(Debug, Clone)]
pub struct Entry {
    pub call_type: String,
    pub(crate) node: String,
}

impl Entry {
    pub(crate) fn new(call_type: impl Into<String>, node: impl Into<String>) -> Self {
        Entry {
            call_type: call_type.into(),
            node: node.into(),
        }
    }

    /// Step id of the node this entry feeds.
    pub fn node_id(&self) -> &str {
        &self.node
    }

    pub async fn call(
        &self,
        engine: &Engine,
        trace_id: &str,
        payload: Option<String>,
    ) -> Result<()> {
        engine.entry_call(&self.call_type, trace_id, payload).await
    }
}

impl Engine {
    /// Invoke a call type for a trace: the external surface of the whole
    /// engine. Resolves ownership locally, or forwards to a process that
    /// can serve the call.
    pub async fn entry_call(
        &self,
        call_type: &str,
        trace_id: &str,
        payload: Option<String>,
    ) -> Result<()> {
        // Pinned traces must be served by their host.
        if let Some(mut cx) = self.load_cx(trace_id).await? {
            if let Some(pin) = cx.pinned_ip().map(str::to_string) {
                if pin != self.host_ip() {
                    match self
                        .resend(&pin, call_type, trace_id, payload.clone())
                        .await
                    {
                        Ok(()) => {
                            self.emit(FlowEvent::TraceTransferred {
                                trace_id: trace_id.to_string(),
                                target_ip: pin,
                            });
                            return Ok(());
                        }
                        Err(err) if self.call_unpin_safe(call_type) => {
                            warn!(
                                "pinned host {pin} unreachable for {trace_id}, unpinning: {err}"
                            );
                            cx.local = false;
                            self.persist_cx(&cx).await?;
                        }
                        Err(err) => {
                            return Err(FlowError::Retry(format!(
                                "pinned host {pin} unreachable: {err}"
                            )));
                        }
                    }
                }
            }
        }

        let Some(owner) = self.call_type_owner(call_type) else {
            return self.forward_call(call_type, trace_id, payload).await;
        };
        let key = entry_key(call_type, &owner);
        let Some(target) = self.entry_target(&key) else {
            return self.forward_call(call_type, trace_id, payload).await;
        };
        match target {
            EntryTarget::Head { step_id } => {
                let (stack_len, pinned) = match self.load_cx(trace_id).await? {
                    Some(cx) => (cx.stack.len(), cx.local),
                    None => (0, false),
                };
                self.activate(trace_id, &step_id, payload, stack_len, pinned)
                    .await
            }
            EntryTarget::Deliver { step_id, index } => {
                let Some(step) = self.step(&step_id) else {
                    return Err(FlowError::NotInited(step_id));
                };
                step.deliver(self, trace_id, index, payload).await
            }
        }
    }

    /// A call type nobody here owns: some other process may have inited
    /// the pipeline. Try each live host before giving up.
    async fn forward_call(
        &self,
        call_type: &str,
        trace_id: &str,
        payload: Option<String>,
    ) -> Result<()> {
        let hosts = self.inner.global_store.host_ips().await?;
        for ip in hosts.iter().filter(|ip| ip.as_str() != self.host_ip()) {
            match self.resend(ip, call_type, trace_id, payload.clone()).await {
                Ok(()) => {
                    debug!("forwarded call {call_type} for {trace_id} to {ip}");
                    self.emit(FlowEvent::TraceTransferred {
                        trace_id: trace_id.to_string(),
                        target_ip: ip.clone(),
                    });
                    return Ok(());
                }
                Err(err) => warn!("host {ip} refused {call_type} for {trace_id}: {err}"),
            }
        }
        Err(FlowError::NotInited(call_type.to_string()))
    }

    pub(crate) async fn resend(
        &self,
        ip: &str,
        call_type: &str,
        trace_id: &str,
        payload: Option<String>,
    ) -> Result<()> {
        let Some(resender) = &self.inner.resender else {
            return Err(FlowError::Channel(
                "no resender configured for cross-host transfer".to_string(),
            ));
        };
        resender.resend_call(ip, call_type, trace_id, payload).await
    }

    fn call_unpin_safe(&self, call_type: &str) -> bool {
        self.call_type_owner(call_type)
            .and_then(|owner| self.step(&owner))
            .map(|step| step.descriptor().unpin_safe)
            .unwrap_or(false)
    }
}
