//! The immutable message - the unit of in-flight state
//!
//! A [`Message`] is the single value that flows along graph edges. It carries
//! the textual payload, two open-keyed bags (`data` for application payload,
//! `metadata` for framework context), pending tool-calls, the execution state
//! machine, and the run coordinates (`graph_id` / `node_id` / `run_id`).
//!
//! # Immutability
//!
//! Every mutator takes `&self` and returns a **new** `Message`; nothing ever
//! updates in place. Concurrent branches and middleware can therefore hold
//! references to the same message without coordination. Structural sharing is
//! an optimization the engine does not depend on - plain clones are correct.
//!
//! ```rust
//! use spice_core::message::Message;
//! use serde_json::json;
//!
//! let first = Message::new("hello");
//! let second = first.with_data("type", json!("A"));
//!
//! assert!(first.data_value("type").is_none());   // original untouched
//! assert_eq!(second.data_str("type"), Some("A"));
//! ```
//!
//! # State Machine
//!
//! ```text
//! READY ──► RUNNING ──► COMPLETED
//!              │ ▲
//!              ▼ │
//!           WAITING      RUNNING ──► FAILED
//! ```
//!
//! `COMPLETED` and `FAILED` are terminal; transitions out of a terminal state
//! are ignored (and logged), which makes re-executing a finished message a
//! no-op by construction. Every accepted transition appends a
//! [`StateTransition`] to `state_history`, an append-only log with
//! non-decreasing timestamps.
//!
//! # Data vs Metadata
//!
//! | Bag | Purpose | Examples |
//! |-----|---------|----------|
//! | `data` | Application payload | user input, tool results, branch picks |
//! | `metadata` | Framework context | traceId, tenantId, subgraph tracking |
//!
//! Metadata keys starting with `_` and the set in [`crate::keys`] are
//! framework-owned.

use crate::keys;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Execution state of a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    /// Created, not yet picked up by a runner
    Ready,
    /// Being advanced through the graph
    Running,
    /// Suspended, awaiting external input
    Waiting,
    /// Finished successfully (terminal)
    Completed,
    /// Finished with an error (terminal)
    Failed,
}

impl MessageState {
    /// Whether no further transitions are permitted
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: MessageState) -> bool {
        use MessageState::*;
        match (self, next) {
            (Ready, Running) => true,
            (Running, Waiting) | (Running, Completed) | (Running, Failed) => true,
            (Waiting, Running) | (Waiting, Failed) => true,
            // Re-entering the same state is tolerated (idempotent resume paths)
            (a, b) if *a == b => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// One entry of the append-only state history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateTransition {
    pub state: MessageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A structured function-call record carried on the message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique id; fresh per emission
    pub id: String,
    /// Tool or prompt-kind name
    pub name: String,
    /// Arguments as a JSON object
    pub arguments: Value,
}

impl ToolCall {
    /// Create a tool-call with a fresh unique id
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// The immutable in-flight payload and execution state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id
    pub id: String,

    /// Primary textual payload
    #[serde(default)]
    pub content: String,

    /// Originating actor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Destination actor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// Current execution state
    pub state: MessageState,

    /// Append-only log of accepted transitions
    #[serde(default)]
    pub state_history: Vec<StateTransition>,

    /// Application payload
    #[serde(default)]
    pub data: HashMap<String, Value>,

    /// Framework/context data
    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    /// Pending tool-calls, in emission order
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,

    /// Graph currently executing this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,

    /// Node that last produced this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// Run identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl Message {
    /// Create a READY message with the given content
    pub fn new(content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            from: None,
            to: None,
            state: MessageState::Ready,
            state_history: vec![StateTransition {
                state: MessageState::Ready,
                reason: Some("created".to_string()),
                timestamp: now,
            }],
            data: HashMap::new(),
            metadata: HashMap::new(),
            tool_calls: Vec::new(),
            graph_id: None,
            node_id: None,
            run_id: None,
        }
    }

    // ---- state machine -----------------------------------------------------

    /// Transition to a new state, appending to the history
    ///
    /// Illegal transitions (including any transition out of a terminal
    /// state) are ignored: the message is returned unchanged and a warning
    /// is logged. Transitioning to the current state appends nothing.
    pub fn transition_to(&self, state: MessageState, reason: impl Into<String>) -> Self {
        if self.state == state {
            return self.clone();
        }
        if !self.state.can_transition_to(state) {
            tracing::warn!(
                message_id = %self.id,
                from = %self.state,
                to = %state,
                "ignoring illegal state transition"
            );
            return self.clone();
        }
        let mut next = self.clone();
        next.state = state;
        next.state_history.push(StateTransition {
            state,
            reason: Some(reason.into()),
            timestamp: Utc::now(),
        });
        next
    }

    // ---- content and actors ------------------------------------------------

    pub fn with_content(&self, content: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.content = content.into();
        next
    }

    pub fn with_from(&self, from: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.from = Some(from.into());
        next
    }

    pub fn with_to(&self, to: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.to = Some(to.into());
        next
    }

    // ---- data --------------------------------------------------------------

    /// Copy with one data entry set
    pub fn with_data(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        next.data.insert(key.into(), value);
        next
    }

    /// Copy with all entries of `entries` merged in (entries win on conflict)
    pub fn with_data_entries(&self, entries: HashMap<String, Value>) -> Self {
        let mut next = self.clone();
        next.data.extend(entries);
        next
    }

    /// Copy with `data` replaced wholesale
    pub fn with_data_replaced(&self, data: HashMap<String, Value>) -> Self {
        let mut next = self.clone();
        next.data = data;
        next
    }

    pub fn data_value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Typed accessor; `None` on absence or type mismatch
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn data_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(|v| v.as_bool())
    }

    pub fn data_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| v.as_i64())
    }

    // ---- metadata ----------------------------------------------------------

    pub fn with_metadata(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.into(), value);
        next
    }

    pub fn with_metadata_entries(&self, entries: HashMap<String, Value>) -> Self {
        let mut next = self.clone();
        next.metadata.extend(entries);
        next
    }

    pub fn without_metadata(&self, key: &str) -> Self {
        let mut next = self.clone();
        next.metadata.remove(key);
        next
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn metadata_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(|v| v.as_bool())
    }

    pub fn metadata_i64(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(|v| v.as_i64())
    }

    // ---- tool calls --------------------------------------------------------

    /// Copy with a tool-call appended
    pub fn with_tool_call(&self, tool_call: ToolCall) -> Self {
        let mut next = self.clone();
        next.tool_calls.push(tool_call);
        next
    }

    /// Copy with the pending tool-calls replaced
    pub fn with_tool_calls(&self, tool_calls: Vec<ToolCall>) -> Self {
        let mut next = self.clone();
        next.tool_calls = tool_calls;
        next
    }

    /// Copy with one tool-call removed by id
    pub fn without_tool_call(&self, id: &str) -> Self {
        let mut next = self.clone();
        next.tool_calls.retain(|tc| tc.id != id);
        next
    }

    /// First pending tool-call with the given name
    pub fn find_tool_call(&self, name: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|tc| tc.name == name)
    }

    /// Most recently emitted pending tool-call
    pub fn last_tool_call(&self) -> Option<&ToolCall> {
        self.tool_calls.last()
    }

    // ---- graph coordinates -------------------------------------------------

    pub fn with_graph_id(&self, graph_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.graph_id = Some(graph_id.into());
        next
    }

    pub fn with_node_id(&self, node_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.node_id = Some(node_id.into());
        next
    }

    pub fn with_run_id(&self, run_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.run_id = Some(run_id.into());
        next
    }

    /// Current subgraph nesting depth (0 at the outermost graph)
    pub fn subgraph_depth(&self) -> u32 {
        self.metadata_i64(keys::SUBGRAPH_DEPTH).unwrap_or(0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mutators_return_new_values() {
        let original = Message::new("x").with_data("a", json!(1));
        let updated = original.with_data("b", json!(2)).with_content("y");

        assert_eq!(original.content, "x");
        assert!(original.data_value("b").is_none());
        assert_eq!(updated.content, "y");
        assert_eq!(updated.data_i64("a"), Some(1));
        assert_eq!(updated.data_i64("b"), Some(2));
    }

    #[test]
    fn test_state_history_is_prefix_extended() {
        let msg = Message::new("x");
        let running = msg.transition_to(MessageState::Running, "started");
        let waiting = running.transition_to(MessageState::Waiting, "paused");

        assert_eq!(waiting.state_history.len(), 3);
        assert_eq!(&waiting.state_history[..2], &running.state_history[..2]);
        for pair in waiting.state_history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn test_terminal_states_absorb() {
        let done = Message::new("x")
            .transition_to(MessageState::Running, "started")
            .transition_to(MessageState::Completed, "finished");

        let after = done.transition_to(MessageState::Running, "should not happen");
        assert_eq!(after.state, MessageState::Completed);
        assert_eq!(after.state_history.len(), done.state_history.len());
    }

    #[test]
    fn test_illegal_transition_ignored() {
        let msg = Message::new("x");
        // READY → WAITING skips RUNNING and is not legal
        let same = msg.transition_to(MessageState::Waiting, "skip");
        assert_eq!(same.state, MessageState::Ready);
    }

    #[test]
    fn test_waiting_round_trip() {
        let msg = Message::new("x")
            .transition_to(MessageState::Running, "started")
            .transition_to(MessageState::Waiting, "hitl")
            .transition_to(MessageState::Running, "resumed")
            .transition_to(MessageState::Completed, "done");
        assert_eq!(msg.state, MessageState::Completed);
    }

    #[test]
    fn test_typed_accessors_soft_fail() {
        let msg = Message::new("x").with_data("n", json!(5));
        assert_eq!(msg.data_i64("n"), Some(5));
        assert_eq!(msg.data_str("n"), None);
        assert_eq!(msg.data_bool("n"), None);
        assert_eq!(msg.data_i64("missing"), None);
    }

    #[test]
    fn test_tool_call_ids_are_unique() {
        let a = ToolCall::new("request_user_input", json!({}));
        let b = ToolCall::new("request_user_input", json!({}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_serde_round_trip_tolerates_unknown_fields() {
        let msg = Message::new("payload").with_data("k", json!("v"));
        let mut value = serde_json::to_value(&msg).unwrap();
        value["future_field"] = json!(123);

        let restored: Message = serde_json::from_value(value).unwrap();
        assert_eq!(restored.id, msg.id);
        assert_eq!(restored.data_str("k"), Some("v"));
    }
}
