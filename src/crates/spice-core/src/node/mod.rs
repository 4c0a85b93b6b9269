//! Node - the polymorphic executable unit of a graph
//!
//! A graph's vertices are [`Node`] implementations. The engine ships six:
//!
//! | Node | Behavior |
//! |------|----------|
//! | [`AgentNode`] | Delegates to an [`Agent`] (LLM, rule engine, ...) |
//! | [`ToolNode`] | Executes a [`Tool`] against pending tool-call arguments |
//! | [`DecisionNode`] | Picks a branch, writes `_selectedBranch` into data |
//! | [`HumanNode`] | Emits a user prompt tool-call and suspends (WAITING) |
//! | [`SubgraphNode`] | Runs a nested child graph with input/output mapping |
//! | [`OutputNode`] | Terminal sink, optionally producing a final value |
//!
//! Nodes are stateless across invocations: all per-run state rides on the
//! [`Message`](crate::message::Message). A node may hold references to
//! external collaborators (an agent, a tool, a child graph) but does not own
//! their lifecycle.

mod agent;
mod decision;
mod human;
mod output;
pub(crate) mod subgraph;
mod tool;

pub use agent::{Agent, AgentNode};
pub use decision::{DecisionBranch, DecisionNode, DecisionNodeBuilder};
pub use human::{HumanNode, SelectionItem};
pub use output::OutputNode;
pub use subgraph::SubgraphNode;
pub use tool::{Tool, ToolNode, ToolResult};

use crate::error::SpiceResult;
use crate::message::Message;
use async_trait::async_trait;

/// Executable graph vertex
///
/// `run` consumes an immutable message and returns a new one; it must not
/// hold mutable state between invocations. Nodes that pause return a message
/// in the WAITING state; nodes that merely transform return RUNNING.
#[async_trait]
pub trait Node: Send + Sync {
    /// Node id, unique within its graph
    fn id(&self) -> &str;

    /// Execute against the in-flight message
    async fn run(&self, message: Message) -> SpiceResult<Message>;

    /// Whether the node is a declared terminal; reaching it with no
    /// matching outgoing edge completes the run instead of failing routing
    fn is_output(&self) -> bool {
        false
    }

    /// Downcast hook for subgraph dispatch; the runner calls
    /// [`SubgraphNode::run_with_runner`] instead of `run` when this
    /// returns `Some`, so runners are never shared through global state
    fn as_subgraph(&self) -> Option<&SubgraphNode> {
        None
    }
}
