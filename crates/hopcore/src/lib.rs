//! A persistable continuation-passing workflow engine.
//!
//! Pipelines are built as typed flows ([`Flow`]), registered once under a
//! pipeline name, and then driven entirely by serialized trace state: every
//! step execution loads the trace, journals a frame, and hands the trace to
//! its successor through the configured message channel. Any process that
//! registered the same pipeline can pick up any hand-off, so a trace
//! survives restarts and migrates across hosts mid-flight.
//!
//! The crate splits into the typed builder ([`flow`]), the runtime engine
//! and its dispatch protocol ([`engine`]), the trace journal ([`context`]),
//! and the SPIs a deployment plugs its infrastructure into ([`store`],
//! [`channel`]). [`harness`] wires a fully in-memory engine for tests.

pub mod channel;
pub mod context;
pub mod engine;
mod entry;
pub mod error;
pub mod flow;
pub mod harness;
pub mod step;
pub mod store;

mod dispatch;

pub use context::{ContextStack, Frame, FrameStatus};
pub use engine::{Backends, Engine, EngineConfig, FlowEvent, FrameLocation};
pub use entry::Entry;
pub use error::{BuildError, FlowError, Result, StoreError};
pub use flow::{AnyFlow, Flow, PipelineInfo};
pub use step::{RaceResult, StepOutcome};
pub use store::RetryPolicy;
