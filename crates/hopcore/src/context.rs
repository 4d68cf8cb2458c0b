//! Serializable execution state for a single trace.
//!
//! The stack is a journal: dispatch only ever pushes frames, and the
//! "current" value of the trace is the result of the topmost `End` frame.
//! Replay is the one operation that rewinds by popping. Keeping history
//! makes halted and finished traces fully inspectable and lets fan-in
//! collection find the frame that recorded its child traces.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a forked branch trace reports back to its parent's join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatherPost {
    /// Sub-entry call type reserved for this branch.
    pub call_type: String,
    /// Step id of the join node owning the entry.
    pub node: String,
    /// Branch position in the fan-out.
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum FrameStatus {
    Begin,
    End,
    Error,
    Retry(String),
}

impl From<FrameStatus> for String {
    fn from(status: FrameStatus) -> String {
        match status {
            FrameStatus::Begin => "BEGIN".to_string(),
            FrameStatus::End => "END".to_string(),
            FrameStatus::Error => "ERROR".to_string(),
            FrameStatus::Retry(reason) => format!("RETRY:{reason}"),
        }
    }
}

impl TryFrom<String> for FrameStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        match value.as_str() {
            "BEGIN" => Ok(FrameStatus::Begin),
            "END" => Ok(FrameStatus::End),
            "ERROR" => Ok(FrameStatus::Error),
            other => match other.strip_prefix("RETRY:") {
                Some(reason) => Ok(FrameStatus::Retry(reason.to_string())),
                None => Err(format!("unknown frame status: {other}")),
            },
        }
    }
}

/// One step invocation in a trace's journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub status: FrameStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Host that executed this frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Trace ids forked from this frame (fan-out joins only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_tasks: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_ms: Option<i64>,
}

impl Frame {
    fn new(name: String, display_name: Option<String>, ip: &str, param: Option<String>) -> Self {
        Frame {
            name,
            display_name,
            status: FrameStatus::Begin,
            param,
            result: None,
            ip: Some(ip.to_string()),
            child_tasks: Vec::new(),
            started_at: Utc::now(),
            cost_ms: None,
        }
    }
}

/// Full state of one trace. Everything a step needs to resume on another
/// process round-trips through [`dump`](ContextStack::dump) and
/// [`rebuild`](ContextStack::rebuild).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextStack {
    pub id: String,
    #[serde(default)]
    pub stack: Vec<Frame>,
    /// Application scratch shared across steps of this trace.
    #[serde(default)]
    pub global: HashMap<String, serde_json::Value>,
    /// Pre-announced id of the step this trace is being handed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(default)]
    pub finished: bool,
    /// Pinned to the host that created it (process-local resources in play).
    #[serde(default)]
    pub local: bool,
    /// Skip persistence entirely; state lives only in the dispatching process.
    #[serde(default)]
    pub no_storage: bool,
    /// Prefer mock hooks over real step bodies (test-mode engines only).
    #[serde(default)]
    pub mock: bool,
    /// Accumulated error log, `kind|message;` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on forked branch traces: the trace that spawned this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_trace: Option<String>,
    /// Set on forked branch traces: where results and failures report back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gather: Option<GatherPost>,
}

impl ContextStack {
    pub fn new(id: impl Into<String>) -> Self {
        ContextStack {
            id: id.into(),
            stack: Vec::new(),
            global: HashMap::new(),
            next_step: None,
            finished: false,
            local: false,
            no_storage: false,
            mock: false,
            error: None,
            parent_trace: None,
            gather: None,
        }
    }

    pub fn top(&self) -> Option<&Frame> {
        self.stack.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.stack.last_mut()
    }

    /// Push a frame for `step_id`. If the previous top frame ended cleanly
    /// its result becomes the new frame's param (the fold that threads a
    /// value through the continuation chain).
    pub fn begin_frame(&mut self, step_id: &str, display_name: Option<String>, ip: &str) {
        let folded = match self.top() {
            Some(prev) if prev.status == FrameStatus::End => prev.result.clone(),
            _ => None,
        };
        self.stack
            .push(Frame::new(step_id.to_string(), display_name, ip, folded));
    }

    /// Mark the top frame done with `result` and record its wall time.
    pub fn end_top(&mut self, result: Option<String>) {
        let now = Utc::now();
        if let Some(frame) = self.stack.last_mut() {
            frame.status = FrameStatus::End;
            frame.result = result;
            frame.cost_ms = Some((now - frame.started_at).num_milliseconds());
        }
    }

    pub fn set_top_status(&mut self, status: FrameStatus) {
        let now = Utc::now();
        if let Some(frame) = self.stack.last_mut() {
            frame.status = status;
            frame.cost_ms = Some((now - frame.started_at).num_milliseconds());
        }
    }

    /// Clone this trace's state into a branch trace. The branch starts
    /// unfinished with no announced successor; the caller announces the
    /// branch head before activating it. Inherited frames drop their
    /// child-task lists: the fork set belongs to the parent's journal.
    pub fn fork_child(&self, child_id: impl Into<String>, gather: GatherPost) -> ContextStack {
        let mut child = self.clone();
        child.id = child_id.into();
        child.next_step = None;
        child.finished = false;
        child.error = None;
        child.parent_trace = Some(self.id.clone());
        child.gather = Some(gather);
        for frame in &mut child.stack {
            frame.child_tasks.clear();
        }
        child
    }

    pub fn append_error(&mut self, kind: &str, message: &str) {
        let entry = format!("{kind}|{message};");
        match &mut self.error {
            Some(log) => log.push_str(&entry),
            None => self.error = Some(entry),
        }
    }

    /// Rewind the journal so `step_id` runs again with its original input:
    /// pop every frame through the most recent one named `step_id` and hand
    /// that frame back. `None` (stack untouched) when that step never ran.
    pub fn rewind_to(&mut self, step_id: &str) -> Option<Frame> {
        let pos = self.stack.iter().rposition(|f| f.name == step_id)?;
        let frame = self.stack[pos].clone();
        self.stack.truncate(pos);
        Some(frame)
    }

    /// Host this trace is pinned to, when pinned: the most recent frame
    /// that recorded an executing host.
    pub fn pinned_ip(&self) -> Option<&str> {
        if !self.local {
            return None;
        }
        self.stack
            .iter()
            .rev()
            .find_map(|f| f.ip.as_deref())
    }

    pub fn dump(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn rebuild(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
