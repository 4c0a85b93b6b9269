//! Resume engine - checkpoint persistence and HITL continuation
//!
//! The [`ResumeEngine`] is the adapter between the stateless
//! [`GraphRunner`] and the [`CheckpointStore`]. It closes the pause/resume
//! loop:
//!
//! 1. [`execute`](ResumeEngine::execute) runs a graph and, when the run
//!    pauses, persists a [`Checkpoint`] built from the WAITING message
//! 2. [`resume_run`](ResumeEngine::resume_run) reloads the latest
//!    checkpoint of a run, validates expiry, merges the user's response,
//!    and re-enters the graph - unwinding nested subgraph pauses through
//!    the checkpoint's subgraph stack
//!
//! The checkpoint's `subgraph_stack` field is authoritative on resume: the
//! copy inside message metadata may have lost type information in a JSON
//! round-trip, so it is overwritten from the checkpoint before re-entry.
//!
//! # Graph Resolution
//!
//! Graphs are resolved through an explicit [`GraphRegistry`] value - there
//! is no global registry. Callers that already hold the graph can skip the
//! registry entirely via [`resume_checkpoint`](ResumeEngine::resume_checkpoint).
//!
//! # Failure Behavior
//!
//! A failed resume surfaces the error (`fail_on_error = true`, default) or
//! resolves to an `Ok` FAILED message (`fail_on_error = false`). Expired or
//! missing checkpoints fail validation without deleting anything; cleanup
//! only happens after a terminal state when `auto_cleanup` is set.

use crate::error::{SpiceError, SpiceResult};
use crate::events::{EventBus, GraphEvent, GraphEventKind};
use crate::graph::Graph;
use crate::keys;
use crate::message::{Message, MessageState};
use crate::node::subgraph::read_stack;
use crate::runner::GraphRunner;
use chrono::Duration;
use serde_json::{json, Value};
use spice_checkpoint::{Checkpoint, CheckpointStore};
use std::collections::HashMap;
use std::sync::Arc;

/// Explicit graph lookup for the resume path; default construction is empty
#[derive(Clone, Default)]
pub struct GraphRegistry {
    graphs: HashMap<String, Arc<Graph>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph under its own id
    pub fn register(mut self, graph: Arc<Graph>) -> Self {
        self.graphs.insert(graph.id().to_string(), graph);
        self
    }

    pub fn get(&self, graph_id: &str) -> Option<Arc<Graph>> {
        self.graphs.get(graph_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

/// Knobs for one resume call
#[derive(Debug, Clone)]
pub struct ResumeOptions {
    /// Publish `ToolCallCompleted` / `WorkflowResumed` events
    pub publish_events: bool,

    /// Delete the run's checkpoints after a terminal state
    pub auto_cleanup: bool,

    /// `true`: a failed run returns `Err`; `false`: it resolves to an
    /// `Ok` message in the FAILED state
    pub fail_on_error: bool,

    /// Enforce checkpoint expiry before resuming
    pub validate_expiration: bool,

    /// Additional age ceiling, independent of the checkpoint's own expiry
    pub max_checkpoint_age: Option<Duration>,

    /// Extra metadata merged into the resumed message
    pub user_response_metadata: HashMap<String, Value>,
}

impl Default for ResumeOptions {
    fn default() -> Self {
        Self {
            publish_events: true,
            auto_cleanup: true,
            fail_on_error: true,
            validate_expiration: true,
            max_checkpoint_age: None,
            user_response_metadata: HashMap::new(),
        }
    }
}

impl ResumeOptions {
    pub fn with_publish_events(mut self, publish: bool) -> Self {
        self.publish_events = publish;
        self
    }

    pub fn with_auto_cleanup(mut self, cleanup: bool) -> Self {
        self.auto_cleanup = cleanup;
        self
    }

    pub fn with_fail_on_error(mut self, fail: bool) -> Self {
        self.fail_on_error = fail;
        self
    }

    pub fn with_validate_expiration(mut self, validate: bool) -> Self {
        self.validate_expiration = validate;
        self
    }

    pub fn with_max_checkpoint_age(mut self, age: Duration) -> Self {
        self.max_checkpoint_age = Some(age);
        self
    }

    pub fn with_user_response_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.user_response_metadata.insert(key.into(), value);
        self
    }
}

/// Pause/resume adapter over a checkpoint store
pub struct ResumeEngine {
    store: Arc<dyn CheckpointStore>,
    registry: GraphRegistry,
    runner: GraphRunner,
    event_bus: Option<Arc<dyn EventBus>>,
    checkpoint_ttl: Option<Duration>,
}

impl ResumeEngine {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            registry: GraphRegistry::new(),
            runner: GraphRunner::new(),
            event_bus: None,
            checkpoint_ttl: None,
        }
    }

    pub fn with_registry(mut self, registry: GraphRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_runner(mut self, runner: GraphRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Expiry applied to checkpoints created by this engine
    pub fn with_checkpoint_ttl(mut self, ttl: Duration) -> Self {
        self.checkpoint_ttl = Some(ttl);
        self
    }

    pub fn runner(&self) -> &GraphRunner {
        &self.runner
    }

    /// Execute a graph and persist a checkpoint when the run pauses
    pub async fn execute(&self, graph: &Graph, message: Message) -> SpiceResult<Message> {
        let result = self.runner.execute(graph, message).await?;
        if result.state == MessageState::Waiting {
            self.checkpoint_waiting(&result).await?;
        }
        Ok(result)
    }

    /// Build and save the checkpoint for a WAITING message
    pub async fn checkpoint_waiting(&self, message: &Message) -> SpiceResult<Checkpoint> {
        if message.state != MessageState::Waiting {
            return Err(SpiceError::validation(format!(
                "cannot checkpoint a {} message, only WAITING",
                message.state
            )));
        }
        let run_id = message
            .run_id
            .clone()
            .ok_or_else(|| SpiceError::validation("WAITING message carries no run id"))?;
        let node_id = message
            .node_id
            .clone()
            .ok_or_else(|| SpiceError::validation("WAITING message carries no node id"))?;

        let mut checkpoint = Checkpoint::new(
            run_id,
            message.graph_id.clone().unwrap_or_default(),
            node_id,
            serde_json::to_value(message)?,
        )
        .with_subgraph_stack(read_stack(message));

        if let Some(tool_call) = message.last_tool_call() {
            checkpoint = checkpoint.with_pending_tool_call(serde_json::to_value(tool_call)?);
        }
        if let Some(ttl) = self.checkpoint_ttl {
            checkpoint = checkpoint.with_expires_in(ttl);
        }

        self.store.save(&checkpoint).await?;
        tracing::info!(
            checkpoint_id = %checkpoint.id,
            run_id = %checkpoint.run_id,
            node_id = %checkpoint.current_node_id,
            stack_depth = checkpoint.subgraph_stack.len(),
            "run paused, checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// Resume the latest checkpoint of a run, resolving the graph from the
    /// registry
    pub async fn resume_run(
        &self,
        run_id: &str,
        user_response: Option<Message>,
        options: &ResumeOptions,
    ) -> SpiceResult<Message> {
        let checkpoint = self
            .store
            .latest_for_run(run_id)
            .await?
            .ok_or_else(|| {
                SpiceError::execution(format!("no checkpoint found for run '{}'", run_id))
                    .with_context("runId", json!(run_id))
            })?;

        let graph = self.registry.get(&checkpoint.graph_id).ok_or_else(|| {
            SpiceError::execution(format!(
                "graph '{}' not found in registry",
                checkpoint.graph_id
            ))
            .with_context("graphId", json!(checkpoint.graph_id))
        })?;

        self.resume_checkpoint(&graph, checkpoint, user_response, options)
            .await
    }

    /// Resume a loaded checkpoint against a caller-provided graph
    pub async fn resume_checkpoint(
        &self,
        graph: &Graph,
        mut checkpoint: Checkpoint,
        user_response: Option<Message>,
        options: &ResumeOptions,
    ) -> SpiceResult<Message> {
        self.validate_checkpoint(&checkpoint, options)?;

        let mut message: Message = serde_json::from_value(checkpoint.message.clone())
            .map_err(|e| SpiceError::checkpoint(format!("corrupt checkpoint message: {}", e)))?;
        message.node_id = Some(checkpoint.current_node_id.clone());

        if let Some(user) = &user_response {
            message = merge_user_response(message, user, options);
        }

        // The checkpoint's stack field is authoritative; re-attach after the
        // user-response merge so nothing can shadow it.
        message.metadata.insert(
            keys::SUBGRAPH_STACK.to_string(),
            serde_json::to_value(&checkpoint.subgraph_stack)?,
        );

        self.acknowledge_pending_tool_call(&mut checkpoint, user_response.as_ref(), options)
            .await?;

        if options.publish_events {
            self.publish(
                graph,
                GraphEvent::new(GraphEventKind::WorkflowResumed)
                    .for_message(&message)
                    .at_node(&checkpoint.current_node_id),
            );
        }
        tracing::info!(
            run_id = %checkpoint.run_id,
            node_id = %checkpoint.current_node_id,
            "resuming run"
        );

        let message = self
            .runner
            .transformers()
            .before_execution(graph, message)
            .await?;

        match self.runner.resume(graph, message).await {
            Ok(result) if result.state == MessageState::Waiting => {
                self.checkpoint_waiting(&result).await?;
                Ok(result)
            }
            Ok(result) => {
                if options.auto_cleanup {
                    self.store.delete_by_run(&checkpoint.run_id).await?;
                    tracing::debug!(run_id = %checkpoint.run_id, "checkpoints cleaned up");
                }
                Ok(result)
            }
            Err(error) if options.fail_on_error => Err(error),
            Err(error) => Ok(failed_message_from(&checkpoint, error)),
        }
    }

    fn validate_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        options: &ResumeOptions,
    ) -> SpiceResult<()> {
        if !options.validate_expiration {
            return Ok(());
        }

        let age = checkpoint.age();
        let too_old = options
            .max_checkpoint_age
            .is_some_and(|max_age| age > max_age);

        if checkpoint.is_expired() || too_old {
            let mut error = SpiceError::validation(format!(
                "checkpoint '{}' has expired",
                checkpoint.id
            ))
            .with_context("checkpointId", json!(checkpoint.id))
            .with_context("checkpointAgeMs", json!(age.num_milliseconds()));
            if let Some(expires_at) = checkpoint.expires_at {
                error = error.with_context("expiresAt", json!(expires_at));
            }
            if let Some(max_age) = options.max_checkpoint_age {
                error =
                    error.with_context("maxCheckpointAgeMs", json!(max_age.num_milliseconds()));
            }
            return Err(error);
        }
        Ok(())
    }

    /// Publish `ToolCallCompleted` for the answered prompt and write the
    /// response tool-call back into the checkpoint for audit (idempotent)
    async fn acknowledge_pending_tool_call(
        &self,
        checkpoint: &mut Checkpoint,
        user_response: Option<&Message>,
        options: &ResumeOptions,
    ) -> SpiceResult<()> {
        let Some(pending) = checkpoint.pending_tool_call.clone() else {
            return Ok(());
        };
        let Some(response) =
            user_response.and_then(|user| user.find_tool_call(keys::USER_RESPONSE))
        else {
            return Ok(());
        };

        if options.publish_events {
            if let Some(bus) = &self.event_bus {
                bus.publish(GraphEvent::new(GraphEventKind::ToolCallReceived {
                    tool_call_id: response.id.clone(),
                    tool_name: response.name.clone(),
                }));
                bus.publish(
                    GraphEvent::new(GraphEventKind::ToolCallCompleted {
                        tool_call_id: pending["id"].as_str().unwrap_or_default().to_string(),
                        tool_name: pending["name"].as_str().unwrap_or_default().to_string(),
                    })
                    .with_metadata("response", response.arguments.clone())
                    .with_metadata("runId", json!(checkpoint.run_id)),
                );
            }
        }

        checkpoint.record_response(serde_json::to_value(response)?);
        self.store.save(checkpoint).await?;
        Ok(())
    }

    fn publish(&self, graph: &Graph, event: GraphEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
            return;
        }
        if let Some(bus) = &graph.config().event_bus {
            bus.publish(event);
        }
    }
}

/// Merge order: checkpoint data ∪ user data ∪ extracted response fields;
/// the user message's tool-calls replace the pending ones
fn merge_user_response(
    checkpoint_message: Message,
    user: &Message,
    options: &ResumeOptions,
) -> Message {
    let mut message = checkpoint_message;
    message.data.extend(user.data.clone());

    if let Some(response) = user.find_tool_call(keys::USER_RESPONSE) {
        let args = &response.arguments;
        if let Some(text) = args.get("text").and_then(Value::as_str) {
            message
                .data
                .insert(keys::RESPONSE_TEXT.to_string(), json!(text));
        }
        if let Some(structured) = args.get("structured_data") {
            message
                .data
                .insert(keys::STRUCTURED_RESPONSE.to_string(), structured.clone());
            if let Some(selected) = structured.get("selected_option") {
                message
                    .data
                    .insert(keys::SELECTED_OPTION.to_string(), selected.clone());
            }
        }
        if let Ok(full_call) = serde_json::to_value(response) {
            message
                .data
                .insert(keys::USER_RESPONSE_TOOL_CALL.to_string(), full_call);
        }
    }

    message.tool_calls = user.tool_calls.clone();
    message.metadata.extend(user.metadata.clone());
    message
        .metadata
        .extend(options.user_response_metadata.clone());
    message
}

/// Best-effort FAILED message for `fail_on_error = false` callers
fn failed_message_from(checkpoint: &Checkpoint, error: SpiceError) -> Message {
    if let Some(snapshot) = error.context().get("failedMessage") {
        if let Ok(failed) = serde_json::from_value::<Message>(snapshot.clone()) {
            return failed;
        }
    }
    match serde_json::from_value::<Message>(checkpoint.message.clone()) {
        Ok(message) => {
            let running = message.transition_to(MessageState::Running, "resumed");
            running.transition_to(
                MessageState::Failed,
                format!("{}: {}", error.code(), error),
            )
        }
        Err(_) => Message::new("")
            .with_run_id(checkpoint.run_id.clone())
            .transition_to(MessageState::Running, "resumed")
            .transition_to(MessageState::Failed, format!("{}: {}", error.code(), error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;

    #[test]
    fn test_registry_lookup() {
        let graph = Arc::new(
            Graph::builder("g")
                .add_node(crate::node::OutputNode::new("out"))
                .with_entry_point("out")
                .build()
                .unwrap(),
        );
        let registry = GraphRegistry::new().register(graph);
        assert!(registry.get("g").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_merge_user_response_extracts_fields() {
        let checkpoint_message = Message::new("paused").with_data("existing", json!(1));
        let user = Message::new("")
            .with_data("extra", json!(2))
            .with_tool_call(ToolCall::new(
                keys::USER_RESPONSE,
                json!({
                    "text": "go ahead",
                    "structured_data": {"selected_option": "confirm_yes"}
                }),
            ));

        let merged = merge_user_response(checkpoint_message, &user, &ResumeOptions::default());

        assert_eq!(merged.data_i64("existing"), Some(1));
        assert_eq!(merged.data_i64("extra"), Some(2));
        assert_eq!(merged.data_str(keys::RESPONSE_TEXT), Some("go ahead"));
        assert_eq!(merged.data_str(keys::SELECTED_OPTION), Some("confirm_yes"));
        assert!(merged.data_value(keys::USER_RESPONSE_TOOL_CALL).is_some());
        assert_eq!(merged.tool_calls.len(), 1);
    }

    #[test]
    fn test_user_response_metadata_applied() {
        let options =
            ResumeOptions::default().with_user_response_metadata("channel", json!("slack"));
        let merged = merge_user_response(Message::new(""), &Message::new(""), &options);
        assert_eq!(merged.metadata_str("channel"), Some("slack"));
    }

    #[test]
    fn test_failed_message_reconstruction() {
        let original = Message::new("x")
            .with_run_id("run-1")
            .transition_to(MessageState::Running, "started")
            .transition_to(MessageState::Waiting, "paused");
        let checkpoint = Checkpoint::new(
            "run-1",
            "g",
            "node",
            serde_json::to_value(&original).unwrap(),
        );

        let failed = failed_message_from(&checkpoint, SpiceError::routing("dead end"));
        assert_eq!(failed.state, MessageState::Failed);
        assert!(failed
            .state_history
            .last()
            .unwrap()
            .reason
            .as_deref()
            .unwrap()
            .starts_with("RoutingError"));
    }
}
