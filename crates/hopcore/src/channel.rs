//! Transport SPIs: step activation messages, external-call forwarding,
//! and delayed resumption.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::FlowError;

/// Call type reserved for cross-host trace transfer.
pub const TRANSFER_CALL_TYPE: &str = "__hopflow_transfer";

/// Payload of a transferred step activation: the pinned host replays the
/// hand-off locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TransferHop {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// One activation, transfer, or external completion on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMessage {
    /// Broker dedup key. Activations derive it from the trace's journal
    /// position so a redelivered hand-off collapses to one id.
    pub message_id: String,
    pub trace_id: String,
    /// Set on activations: the step being told to run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Set on transfers and external completions: the entry being invoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl StepMessage {
    pub fn activation(trace_id: &str, step_id: &str, stack_len: usize) -> Self {
        StepMessage {
            message_id: format!("{trace_id}-{stack_len}"),
            trace_id: trace_id.to_string(),
            step_id: Some(step_id.to_string()),
            call_type: None,
            payload: None,
        }
    }

    pub fn entry_call(trace_id: &str, call_type: &str, payload: Option<String>) -> Self {
        StepMessage {
            message_id: Uuid::new_v4().to_string(),
            trace_id: trace_id.to_string(),
            step_id: None,
            call_type: Some(call_type.to_string()),
            payload,
        }
    }
}

/// Installed by [`Engine::start`](crate::engine::Engine::start); invoked once
/// per delivered message. A retryable error tells the transport to redeliver.
pub type MessageHandler =
    Arc<dyn Fn(StepMessage) -> BoxFuture<'static, Result<(), FlowError>> + Send + Sync>;

#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, message: StepMessage) -> Result<(), FlowError>;
    async fn subscribe(&self, handler: MessageHandler) -> Result<(), FlowError>;
}

/// Forwards an external call to the process that can actually serve it
/// (pinned traces, partially-deployed pipelines).
#[async_trait]
pub trait RequestResender: Send + Sync {
    async fn resend_call(
        &self,
        ip: &str,
        call_type: &str,
        trace_id: &str,
        payload: Option<String>,
    ) -> Result<(), FlowError>;
}

/// Arranges a future resumption of a suspended delay step.
#[async_trait]
pub trait DelayScheduler: Send + Sync {
    async fn schedule(
        &self,
        engine: Engine,
        trace_id: String,
        step_id: String,
        delay: Duration,
    ) -> Result<(), FlowError>;
}
