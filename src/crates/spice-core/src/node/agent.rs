//! Agent-backed node
//!
//! An [`Agent`] is anything that can process a message: an LLM provider
//! adapter, a rule engine, a swarm aggregator. The engine never looks inside;
//! it only requires that the agent preserves the run coordinates and treats
//! its input as immutable.

use crate::error::SpiceResult;
use crate::message::Message;
use crate::node::Node;
use async_trait::async_trait;
use std::sync::Arc;

/// External message processor plugged into the graph
#[async_trait]
pub trait Agent: Send + Sync {
    /// Agent name, used in logs and error context
    fn name(&self) -> &str;

    /// Process a message, returning a new one
    ///
    /// Must not mutate the input and must preserve `graph_id` / `node_id` /
    /// `run_id` on the output.
    async fn process_message(&self, message: Message) -> SpiceResult<Message>;
}

/// Node wrapping an [`Agent`]
pub struct AgentNode {
    id: String,
    agent: Arc<dyn Agent>,
}

impl AgentNode {
    pub fn new(id: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        Self {
            id: id.into(),
            agent,
        }
    }
}

#[async_trait]
impl Node for AgentNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, message: Message) -> SpiceResult<Message> {
        let coords = (
            message.graph_id.clone(),
            message.node_id.clone(),
            message.run_id.clone(),
        );

        // Errors pass through untransformed; only context is added.
        let output = self
            .agent
            .process_message(message)
            .await
            .map_err(|e| e.with_context("agentName", serde_json::json!(self.agent.name())))?;

        // Agents must not lose the run coordinates; restore if dropped.
        let mut output = output;
        if output.graph_id.is_none() {
            output.graph_id = coords.0;
        }
        if output.node_id.is_none() {
            output.node_id = coords.1;
        }
        if output.run_id.is_none() {
            output.run_id = coords.2;
        }
        Ok(output)
    }
}
