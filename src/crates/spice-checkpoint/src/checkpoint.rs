//! Core checkpoint data structures for pause/resume persistence
//!
//! This module defines the fundamental data types of the checkpoint system:
//! **[`Checkpoint`]** and **[`SubgraphCheckpointContext`]**. A checkpoint is a
//! complete snapshot of a paused graph run, sufficient to resume execution
//! later, potentially in a different process.
//!
//! # Overview
//!
//! Checkpoints are created when a run reaches a WAITING state (typically a
//! human-in-the-loop node) and are destroyed when the resumed run reaches a
//! terminal state. They enable:
//!
//! - **Pause/Resume** - Suspend at a human-input node, resume with the answer
//! - **Process Restarts** - Serialized snapshots survive restarts
//! - **Nested Resumption** - The subgraph stack records every parent context
//!   so a pause deep inside nested subgraphs unwinds correctly
//! - **Audit** - The pending and response tool-calls are kept for inspection
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Checkpoint                                               │
//! │  • id: "uuid-abc"                                         │
//! │  • run_id: "run-42"                                       │
//! │  • graph_id: "onboarding"                                 │
//! │  • current_node_id: "confirm"      ← node that paused     │
//! │  • message: {...}                  ← full paused message  │
//! │  • pending_tool_call: {...}        ← awaiting a response  │
//! │  • response_tool_call: None        ← written on resume    │
//! │  • subgraph_stack: [               ← outermost first      │
//! │      { parent_node_id: "review",  depth: 0, ... },        │
//! │      { parent_node_id: "confirm", depth: 1, ... },        │
//! │    ]                                                      │
//! │  • timestamp / expires_at                                 │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Serialization
//!
//! All checkpoint types serialize to JSON via serde. Field ordering is
//! irrelevant, unknown fields are tolerated on read, and `subgraph_stack` is
//! always written even when empty. The paused message is stored as a raw
//! [`serde_json::Value`]: heterogeneous metadata maps can lose type tags in a
//! JSON round-trip, so the typed `subgraph_stack` field - not the copy inside
//! message metadata - is authoritative when resuming.
//!
//! # Quick Start
//!
//! ```rust
//! use spice_checkpoint::{Checkpoint, SubgraphCheckpointContext};
//! use chrono::Duration;
//! use serde_json::json;
//!
//! let checkpoint = Checkpoint::new(
//!     "run-42",
//!     "onboarding",
//!     "confirm",
//!     json!({"id": "msg-1", "state": "WAITING"}),
//! )
//! .with_expires_in(Duration::hours(24));
//!
//! assert!(!checkpoint.is_expired());
//! assert!(checkpoint.subgraph_stack.is_empty());
//! ```
//!
//! # See Also
//!
//! - [`CheckpointStore`](crate::store::CheckpointStore) - Persistence trait
//! - [`InMemoryCheckpointStore`](crate::memory::InMemoryCheckpointStore) -
//!   Reference implementation

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Parent resume context recorded when a nested subgraph pauses
///
/// One context is pushed per subgraph level between the outermost graph and
/// the node that paused. The stack is ordered outermost-first; resuming pops
/// contexts one at a time, re-enters the child graph, and applies the
/// recorded `output_mapping` once the child completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubgraphCheckpointContext {
    /// Node in the parent graph that holds the child graph
    pub parent_node_id: String,

    /// Graph the parent node belongs to
    pub parent_graph_id: String,

    /// Run ID of the parent execution
    pub parent_run_id: String,

    /// Graph executing as the child
    pub child_graph_id: String,

    /// Node inside the child graph where execution paused
    pub child_node_id: String,

    /// Run ID of the child execution
    pub child_run_id: String,

    /// Child data key → parent data key renames applied on child completion
    #[serde(default)]
    pub output_mapping: HashMap<String, String>,

    /// Nesting depth of the child (0 = direct child of the outermost graph)
    #[serde(default)]
    pub depth: u32,
}

/// Serializable snapshot of a paused graph run
///
/// Everything needed to resume: the paused message, the node it paused at,
/// the tool-call awaiting a user response, and the stack of parent subgraph
/// contexts when the pause happened inside nested subgraphs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint ID
    pub id: CheckpointId,

    /// Run this checkpoint belongs to; resume looks up the latest by run
    pub run_id: String,

    /// Graph that was executing
    pub graph_id: String,

    /// Node where execution paused
    pub current_node_id: String,

    /// The complete paused message, serialized
    pub message: serde_json::Value,

    /// Tool-call emitted at the pause, awaiting a user response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tool_call: Option<serde_json::Value>,

    /// The user-response tool-call, written back on resume for audit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_tool_call: Option<serde_json::Value>,

    /// Pending parent contexts, outermost first; always serialized
    #[serde(default)]
    pub subgraph_stack: Vec<SubgraphCheckpointContext>,

    /// When the checkpoint was created
    pub timestamp: DateTime<Utc>,

    /// When the checkpoint stops being resumable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Create a new checkpoint for a paused run
    pub fn new(
        run_id: impl Into<String>,
        graph_id: impl Into<String>,
        current_node_id: impl Into<String>,
        message: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            graph_id: graph_id.into(),
            current_node_id: current_node_id.into(),
            message,
            pending_tool_call: None,
            response_tool_call: None,
            subgraph_stack: Vec::new(),
            timestamp: Utc::now(),
            expires_at: None,
        }
    }

    /// Set the tool-call awaiting a user response
    pub fn with_pending_tool_call(mut self, tool_call: serde_json::Value) -> Self {
        self.pending_tool_call = Some(tool_call);
        self
    }

    /// Set the subgraph stack (outermost context first)
    pub fn with_subgraph_stack(mut self, stack: Vec<SubgraphCheckpointContext>) -> Self {
        self.subgraph_stack = stack;
        self
    }

    /// Set an absolute expiry time
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Set the expiry relative to the checkpoint timestamp
    pub fn with_expires_in(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(self.timestamp + ttl);
        self
    }

    /// Whether the checkpoint's own expiry has passed
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() > expires_at,
            None => false,
        }
    }

    /// Age of the checkpoint
    pub fn age(&self) -> Duration {
        Utc::now() - self.timestamp
    }

    /// Record the user-response tool-call for audit; idempotent
    pub fn record_response(&mut self, tool_call: serde_json::Value) {
        if self.response_tool_call.is_none() {
            self.response_tool_call = Some(tool_call);
        }
    }
}
