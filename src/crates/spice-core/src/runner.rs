//! GraphRunner - the traversal engine
//!
//! The runner advances a [`Message`] across a [`Graph`], one node at a time:
//!
//! ```text
//! Message → beforeNode → Node.run (via RetrySupervisor) → afterNode
//!         → edge evaluation → next node ...
//! ```
//!
//! The loop stops on three conditions:
//!
//! - **COMPLETED** - an edge reached [`Graph::END`], or a declared output
//!   node has no matching outgoing edge
//! - **WAITING** - a node suspended (human input, subgraph pause); the
//!   runner yields the message so the caller can persist a checkpoint
//! - **Failure** - a node failed beyond its retry policy, a transformer
//!   with `continue_on_failure = false` failed, or no edge matched a
//!   non-terminal node (`RoutingError`)
//!
//! # Statelessness
//!
//! The runner holds configuration only (transformers, retry supervision,
//! optional node timeout) - never per-run state. Any number of runs may
//! share one runner concurrently; all run state lives on the message.
//!
//! # Resume
//!
//! [`GraphRunner::resume`] re-enters a WAITING message. When the pause
//! happened inside nested subgraphs the message carries a subgraph stack
//! (outermost context first); resume pops one context per level, recurses
//! into the child graph at the recorded node, and on child completion
//! applies that context's output mapping before continuing the parent
//! traversal. The paused node itself is **not** re-run - execution
//! continues along its outgoing edges.
//!
//! # Example
//!
//! ```rust
//! use spice_core::graph::Graph;
//! use spice_core::message::{Message, MessageState};
//! use spice_core::node::OutputNode;
//! use spice_core::runner::GraphRunner;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = Graph::builder("hello")
//!     .add_node(OutputNode::new("out"))
//!     .with_entry_point("out")
//!     .build()?;
//!
//! let runner = GraphRunner::new();
//! let result = runner.execute(&graph, Message::new("hi")).await?;
//! assert_eq!(result.state, MessageState::Completed);
//! # Ok(())
//! # }
//! ```

use crate::error::{SpiceError, SpiceResult};
use crate::events::{EventBus, GraphEvent, GraphEventKind};
use crate::graph::Graph;
use crate::keys;
use crate::message::{Message, MessageState};
use crate::node::subgraph::{merge_child_output, read_stack};
use crate::node::Node;
use crate::retry::{RetryOutcome, RetryPolicy, RetrySupervisor};
use crate::transform::{Transformer, TransformerChain};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

enum Next {
    Node(String),
    Complete,
}

/// Stateless traversal engine
#[derive(Clone, Default)]
pub struct GraphRunner {
    transformers: TransformerChain,
    supervisor: RetrySupervisor,
    default_policy: RetryPolicy,
    node_timeout: Option<Duration>,
}

impl GraphRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transformer to the middleware chain
    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformers = self.transformers.push(transformer);
        self
    }

    pub fn with_supervisor(mut self, supervisor: RetrySupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Policy used when the graph config does not carry one
    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Wrap each node attempt in a timeout
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    pub fn transformers(&self) -> &TransformerChain {
        &self.transformers
    }

    /// Run from the entry point (or `message.node_id` when set) until
    /// terminal or WAITING
    pub async fn execute(&self, graph: &Graph, message: Message) -> SpiceResult<Message> {
        self.execute_boxed(graph, message).await
    }

    /// Continue a WAITING message, unwinding nested subgraph pauses
    pub async fn resume(&self, graph: &Graph, message: Message) -> SpiceResult<Message> {
        self.resume_boxed(graph, message).await
    }

    // Boxing breaks the async recursion cycle through SubgraphNode.
    fn execute_boxed<'a>(
        &'a self,
        graph: &'a Graph,
        message: Message,
    ) -> BoxFuture<'a, SpiceResult<Message>> {
        Box::pin(self.execute_impl(graph, message))
    }

    fn resume_boxed<'a>(
        &'a self,
        graph: &'a Graph,
        message: Message,
    ) -> BoxFuture<'a, SpiceResult<Message>> {
        Box::pin(self.resume_impl(graph, message))
    }

    async fn execute_impl(&self, graph: &Graph, message: Message) -> SpiceResult<Message> {
        if message.state.is_terminal() {
            return Ok(message);
        }

        let mut message = message;
        if message.run_id.is_none() {
            message = message.with_run_id(Uuid::new_v4().to_string());
        }
        if message.graph_id.is_none() {
            message = message.with_graph_id(graph.id());
        }

        let fresh_start = message.state == MessageState::Ready;
        if fresh_start {
            self.publish(
                graph,
                GraphEvent::new(GraphEventKind::WorkflowStarted).for_message(&message),
            );
            message = message.transition_to(MessageState::Running, "execution started");
        }

        let input = message.clone();
        message = self.transformers.before_execution(graph, message).await?;

        let start_node = message
            .node_id
            .clone()
            .unwrap_or_else(|| graph.entry_point().to_string());

        self.run_from(graph, start_node, input, message).await
    }

    /// The step loop: run `current`, yield on WAITING, follow edges
    async fn run_from(
        &self,
        graph: &Graph,
        start_node: String,
        input: Message,
        message: Message,
    ) -> SpiceResult<Message> {
        let mut current_node_id = start_node;
        let mut message = message;

        loop {
            message = self.run_node_step(graph, &current_node_id, message).await?;

            if message.state == MessageState::Waiting {
                self.publish(
                    graph,
                    GraphEvent::new(GraphEventKind::WorkflowPaused)
                        .for_message(&message)
                        .at_node(&current_node_id),
                );
                tracing::info!(
                    graph_id = graph.id(),
                    node_id = %current_node_id,
                    "run paused, caller should persist a checkpoint"
                );
                return Ok(message);
            }

            match self.next_node(graph, &current_node_id, &message)? {
                Next::Node(next_id) => current_node_id = next_id,
                Next::Complete => return self.complete_run(graph, input, message).await,
            }
        }
    }

    /// Execute one node under transformers, retry supervision, timeout,
    /// and panic containment
    async fn run_node_step(
        &self,
        graph: &Graph,
        node_id: &str,
        message: Message,
    ) -> SpiceResult<Message> {
        let node = graph.node(node_id).ok_or_else(|| {
            SpiceError::execution_at(
                format!("node '{}' not found in graph '{}'", node_id, graph.id()),
                Some(graph.id().to_string()),
                Some(node_id.to_string()),
            )
        })?;

        let pre_hook_snapshot = message.clone();
        let message = match self.transformers.before_node(graph, node_id, message).await {
            Ok(message) => message,
            Err(error) => {
                return Err(self.fail_run(graph, node_id, Some(&pre_hook_snapshot), error))
            }
        };

        self.publish(
            graph,
            GraphEvent::new(GraphEventKind::NodeStarted)
                .for_message(&message)
                .at_node(node_id),
        );
        tracing::debug!(graph_id = graph.id(), node_id, "executing node");

        let policy = graph
            .config()
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.default_policy.clone());
        let supervisor = match &graph.config().event_bus {
            Some(bus) => self.supervisor.clone().with_event_bus(bus.clone()),
            None => self.supervisor.clone(),
        };

        let input_snapshot = message.clone();
        let outcome = supervisor
            .execute_with_retry(&message, node_id, &policy, |msg, _attempt| {
                self.dispatch(node, msg)
            })
            .await;

        match outcome {
            RetryOutcome::Success { value: output, .. } => {
                let output = match self
                    .transformers
                    .after_node(graph, node_id, &input_snapshot, output)
                    .await
                {
                    Ok(output) => output,
                    Err(error) => {
                        return Err(self.fail_run(graph, node_id, Some(&input_snapshot), error))
                    }
                };
                let output = output.with_node_id(node_id);

                self.publish_emitted_tool_calls(graph, node_id, &input_snapshot, &output);
                self.publish(
                    graph,
                    GraphEvent::new(GraphEventKind::NodeCompleted)
                        .for_message(&output)
                        .at_node(node_id),
                );
                Ok(output)
            }
            RetryOutcome::Exhausted { error, .. } | RetryOutcome::NotRetryable { error, .. } => {
                // Give after-node hooks their failure callback before failing
                // the run; their own result cannot rescue the step.
                let annotated = input_snapshot
                    .with_metadata("lastNodeError", json!(error.code()));
                let _ = self
                    .transformers
                    .after_node(graph, node_id, &input_snapshot, annotated)
                    .await;

                Err(self.fail_run(graph, node_id, Some(&input_snapshot), error))
            }
        }
    }

    /// Node invocation with subgraph dispatch, timeout, and panic capture
    async fn dispatch(&self, node: &Arc<dyn Node>, message: Message) -> SpiceResult<Message> {
        let node_id = node.id().to_string();
        let invocation = async {
            match node.as_subgraph() {
                Some(subgraph) => subgraph.run_with_runner(message, self).await,
                None => node.run(message).await,
            }
        };
        let guarded = AssertUnwindSafe(invocation).catch_unwind();

        let caught = match self.node_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(caught) => caught,
                Err(_) => {
                    return Err(SpiceError::timeout_after(
                        format!("node '{}' exceeded its time limit", node_id),
                        limit.as_millis() as u64,
                    ))
                }
            },
            None => guarded.await,
        };

        match caught {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| panic.downcast_ref::<&str>().copied())
                    .unwrap_or("non-string panic payload");
                Err(
                    SpiceError::execution(format!("node '{}' panicked", node_id))
                        .with_context("panicMessage", json!(detail)),
                )
            }
        }
    }

    /// First matching edge in declared order; output nodes complete when
    /// nothing matches, everything else is a routing failure
    fn next_node(&self, graph: &Graph, current: &str, message: &Message) -> SpiceResult<Next> {
        for edge in graph.edges_from(current) {
            if edge.matches(message) {
                if edge.to == Graph::END {
                    return Ok(Next::Complete);
                }
                return Ok(Next::Node(edge.to.clone()));
            }
        }

        let is_output = graph
            .node(current)
            .map(|node| node.is_output())
            .unwrap_or(false);
        if is_output {
            return Ok(Next::Complete);
        }

        Err(self.fail_run(
            graph,
            current,
            Some(message),
            SpiceError::routing(format!(
                "no matching edge from node '{}' in graph '{}'",
                current,
                graph.id()
            )),
        ))
    }

    async fn complete_run(
        &self,
        graph: &Graph,
        input: Message,
        message: Message,
    ) -> SpiceResult<Message> {
        let completed = message.transition_to(MessageState::Completed, "workflow completed");
        let completed = self
            .transformers
            .after_execution(graph, &input, completed)
            .await?;

        self.publish(
            graph,
            GraphEvent::new(GraphEventKind::WorkflowCompleted {
                final_state: MessageState::Completed,
            })
            .for_message(&completed),
        );
        tracing::info!(
            graph_id = graph.id(),
            run_id = completed.run_id.as_deref().unwrap_or(""),
            "workflow completed"
        );
        Ok(completed)
    }

    /// Publish failure events, record the FAILED message in the error
    /// context, and enrich the error with run coordinates
    fn fail_run(
        &self,
        graph: &Graph,
        node_id: &str,
        message: Option<&Message>,
        error: SpiceError,
    ) -> SpiceError {
        let code = error.code();
        if let Some(message) = message {
            let failed = message.transition_to(
                MessageState::Failed,
                format!("{}: {}", code, error),
            );
            self.publish(
                graph,
                GraphEvent::new(GraphEventKind::NodeFailed {
                    error_code: code.to_string(),
                })
                .for_message(&failed)
                .at_node(node_id),
            );
            self.publish(
                graph,
                GraphEvent::new(GraphEventKind::WorkflowCompleted {
                    final_state: MessageState::Failed,
                })
                .for_message(&failed),
            );
            tracing::warn!(
                graph_id = graph.id(),
                node_id,
                error_code = code,
                "workflow failed"
            );
            return match serde_json::to_value(&failed) {
                Ok(snapshot) => error
                    .with_context("failedMessage", snapshot)
                    .with_context("failedNodeId", json!(node_id)),
                Err(_) => error.with_context("failedNodeId", json!(node_id)),
            };
        }

        self.publish(
            graph,
            GraphEvent::new(GraphEventKind::NodeFailed {
                error_code: code.to_string(),
            })
            .at_node(node_id),
        );
        error.with_context("failedNodeId", json!(node_id))
    }

    /// Emit `ToolCallEmitted` for tool-calls the node added
    fn publish_emitted_tool_calls(
        &self,
        graph: &Graph,
        node_id: &str,
        input: &Message,
        output: &Message,
    ) {
        for tool_call in &output.tool_calls {
            if input.tool_calls.iter().all(|tc| tc.id != tool_call.id) {
                self.publish(
                    graph,
                    GraphEvent::new(GraphEventKind::ToolCallEmitted {
                        tool_call_id: tool_call.id.clone(),
                        tool_name: tool_call.name.clone(),
                    })
                    .for_message(output)
                    .at_node(node_id),
                );
            }
        }
    }

    fn publish(&self, graph: &Graph, event: GraphEvent) {
        if let Some(bus) = &graph.config().event_bus {
            bus.publish(event);
        }
    }

    async fn resume_impl(&self, graph: &Graph, message: Message) -> SpiceResult<Message> {
        if message.state.is_terminal() {
            return Ok(message);
        }

        let stack = read_stack(&message);
        if let Some((outer, rest)) = stack.split_first() {
            let node = graph.node(&outer.parent_node_id).ok_or_else(|| {
                SpiceError::execution_at(
                    format!(
                        "subgraph stack names node '{}' missing from graph '{}'",
                        outer.parent_node_id,
                        graph.id()
                    ),
                    Some(graph.id().to_string()),
                    Some(outer.parent_node_id.clone()),
                )
            })?;
            let subgraph = node.as_subgraph().ok_or_else(|| {
                SpiceError::execution(format!(
                    "node '{}' in the subgraph stack is not a subgraph node",
                    outer.parent_node_id
                ))
            })?;

            // Descend: hand the message to the child at the recorded node,
            // with the remaining (inner) stack.
            let mut child_message = message.clone();
            child_message.graph_id = Some(outer.child_graph_id.clone());
            child_message.run_id = Some(outer.child_run_id.clone());
            child_message.node_id = Some(outer.child_node_id.clone());
            child_message.metadata.insert(
                keys::SUBGRAPH_STACK.to_string(),
                serde_json::to_value(rest).unwrap_or(json!([])),
            );

            let child_result = self
                .resume_boxed(subgraph.child_graph(), child_message)
                .await
                .map_err(|e| {
                    e.with_context("subgraphId", json!(outer.child_graph_id))
                        .with_context("subgraphDepth", json!(outer.depth + 1))
                        .with_context("parentGraphId", json!(outer.parent_graph_id))
                })?;

            if child_result.state == MessageState::Waiting {
                // Paused again deeper down: push our context back on top.
                let mut stack = vec![outer.clone()];
                stack.extend(read_stack(&child_result));

                let mut paused = child_result;
                paused.graph_id = Some(outer.parent_graph_id.clone());
                paused.run_id = Some(outer.parent_run_id.clone());
                paused.node_id = Some(outer.parent_node_id.clone());
                paused.metadata.insert(
                    keys::SUBGRAPH_STACK.to_string(),
                    serde_json::to_value(&stack).unwrap_or(json!([])),
                );
                return Ok(paused);
            }

            // Child finished: apply this level's output mapping and carry on
            // from the subgraph node's outgoing edges.
            let mut merged = message.clone();
            merged.data = merge_child_output(
                &message.data,
                &child_result.data,
                &outer.output_mapping,
            );
            merged.content = child_result.content;
            merged.tool_calls = child_result.tool_calls;
            merged.graph_id = Some(outer.parent_graph_id.clone());
            merged.run_id = Some(outer.parent_run_id.clone());
            merged.node_id = Some(outer.parent_node_id.clone());
            merged.metadata.remove(keys::SUBGRAPH_STACK);
            merged.metadata.insert(
                keys::LAST_SUBGRAPH_ID.to_string(),
                json!(outer.child_graph_id),
            );
            merged.metadata.insert(
                keys::LAST_SUBGRAPH_STATE.to_string(),
                json!(child_result.state.to_string()),
            );

            let merged = merged.transition_to(MessageState::Running, "subgraph resumed");
            let input = merged.clone();
            return self
                .advance(graph, outer.parent_node_id.clone(), input, merged)
                .await;
        }

        // Innermost level: the paused node already ran, continue along its
        // outgoing edges with the merged user response.
        let paused_node = message
            .node_id
            .clone()
            .or_else(|| {
                message
                    .metadata_str(keys::PAUSED_NODE_ID)
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                SpiceError::validation("cannot resume: message carries no paused node id")
            })?;

        let message = message.transition_to(MessageState::Running, "resumed");
        let input = message.clone();
        self.advance(graph, paused_node, input, message).await
    }

    /// Pick the next edge from `from` and continue the step loop there
    async fn advance(
        &self,
        graph: &Graph,
        from: String,
        input: Message,
        message: Message,
    ) -> SpiceResult<Message> {
        match self.next_node(graph, &from, &message)? {
            Next::Node(next_id) => self.run_from(graph, next_id, input, message).await,
            Next::Complete => self.complete_run(graph, input, message).await,
        }
    }
}
