//! Subgraph node - nested graph execution with input/output mapping
//!
//! A [`SubgraphNode`] embeds a fully-constructed child [`Graph`] as a single
//! vertex of its parent. Entering the node builds a fresh child message
//! (input mapping resolved through the [`TemplateResolver`], preserved
//! metadata copied, tracking keys advanced) and executes the child through
//! the caller's runner, so no runner state is ever shared globally.
//!
//! # Pause Propagation
//!
//! When the child pauses (WAITING), the node records a
//! [`SubgraphCheckpointContext`] and **prepends** it to whatever stack the
//! child already carries, keeping the outermost context first. The returned
//! WAITING message carries the parent's coordinates, so the checkpoint is
//! stored at parent level, while the stack under `__subgraphStack` remembers
//! every level to unwind on resume.
//!
//! # Mapping Priority
//!
//! - `input_mapping` values always override inherited parent data
//! - `output_mapping`-renamed child values override parent data
//! - unmapped child keys fill in remaining parent slots
//!
//! Child graphs never know their parent: all parent context travels on the
//! message, which keeps the object graph acyclic.

use crate::error::{SpiceError, SpiceResult};
use crate::graph::Graph;
use crate::keys;
use crate::message::{Message, MessageState};
use crate::node::Node;
use crate::runner::GraphRunner;
use crate::template::TemplateResolver;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use spice_checkpoint::SubgraphCheckpointContext;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Default nesting limit
pub const DEFAULT_MAX_DEPTH: u32 = 5;

/// Node that runs a nested child graph
pub struct SubgraphNode {
    id: String,
    child: Arc<Graph>,
    /// Child data key → template resolved against the parent message
    input_mapping: HashMap<String, Value>,
    /// Child data key → parent data key rename on completion
    output_mapping: HashMap<String, String>,
    max_depth: u32,
    preserve_keys: Vec<String>,
    resolver: TemplateResolver,
}

impl std::fmt::Debug for SubgraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubgraphNode")
            .field("id", &self.id)
            .field("child_graph_id", &self.child.id())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

impl SubgraphNode {
    pub fn new(id: impl Into<String>, child: Arc<Graph>) -> Self {
        Self {
            id: id.into(),
            child,
            input_mapping: HashMap::new(),
            output_mapping: HashMap::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            preserve_keys: keys::PRESERVED_METADATA_KEYS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            resolver: TemplateResolver::new(),
        }
    }

    /// Map a child data key to a template (`{{data.x}}`, `{{metadata.y}}`,
    /// or a literal) resolved against the parent message
    pub fn with_input(mut self, child_key: impl Into<String>, template: Value) -> Self {
        self.input_mapping.insert(child_key.into(), template);
        self
    }

    /// Rename a child output key into the parent data bag
    pub fn with_output(
        mut self,
        child_key: impl Into<String>,
        parent_key: impl Into<String>,
    ) -> Self {
        self.output_mapping
            .insert(child_key.into(), parent_key.into());
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Replace the preserved-metadata key set
    pub fn with_preserve_keys(
        mut self,
        preserve_keys: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.preserve_keys = preserve_keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_template_resolver(mut self, resolver: TemplateResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn child_graph(&self) -> &Arc<Graph> {
        &self.child
    }

    pub fn output_mapping(&self) -> &HashMap<String, String> {
        &self.output_mapping
    }

    /// Execute the child graph with the caller's runner
    pub async fn run_with_runner(
        &self,
        message: Message,
        runner: &GraphRunner,
    ) -> SpiceResult<Message> {
        let depth = message.subgraph_depth();
        if depth >= self.max_depth {
            return Err(SpiceError::execution(format!(
                "subgraph '{}' exceeded depth limit {}",
                self.child.id(),
                self.max_depth
            ))
            .with_context("subgraphId", json!(self.child.id()))
            .with_context("subgraphDepth", json!(depth)));
        }

        let parent_run_id = message
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let parent_graph_id = message.graph_id.clone().unwrap_or_default();
        let child_run_id = format!("{}:subgraph:{}", parent_run_id, self.child.id());
        let entered_at = Utc::now();

        let child_message = self.build_child_message(
            &message,
            &parent_run_id,
            &parent_graph_id,
            &child_run_id,
            depth,
        );

        tracing::debug!(
            node_id = %self.id,
            child_graph_id = self.child.id(),
            child_run_id = %child_run_id,
            depth = depth + 1,
            "entering subgraph"
        );

        let child_result = runner
            .execute(&self.child, child_message)
            .await
            .map_err(|e| {
                e.with_context("subgraphId", json!(self.child.id()))
                    .with_context("subgraphDepth", json!(depth + 1))
                    .with_context("parentGraphId", json!(parent_graph_id))
            })?;

        if child_result.state == MessageState::Waiting {
            return Ok(self.propagate_pause(
                &message,
                child_result,
                &parent_run_id,
                &parent_graph_id,
                &child_run_id,
                depth,
            ));
        }

        let elapsed_ms = (Utc::now() - entered_at).num_milliseconds();
        Ok(self.merge_child_completion(&message, child_result, elapsed_ms))
    }

    /// Fresh child message: reset coordinates and state, merged data,
    /// preserved + tracking metadata
    fn build_child_message(
        &self,
        parent: &Message,
        parent_run_id: &str,
        parent_graph_id: &str,
        child_run_id: &str,
        depth: u32,
    ) -> Message {
        let mut data = parent.data.clone();
        for (child_key, template) in &self.input_mapping {
            data.insert(child_key.clone(), self.resolver.resolve(template, parent));
        }

        let mut metadata = HashMap::new();
        for key in &self.preserve_keys {
            if let Some(value) = parent.metadata.get(key) {
                metadata.insert(key.clone(), value.clone());
            }
        }
        let path = match parent.metadata_str(keys::SUBGRAPH_PATH) {
            Some(prefix) => format!("{}/{}", prefix, self.child.id()),
            None => self.child.id().to_string(),
        };
        metadata.insert(keys::SUBGRAPH_DEPTH.to_string(), json!(depth + 1));
        metadata.insert(keys::PARENT_GRAPH_ID.to_string(), json!(parent_graph_id));
        metadata.insert(keys::PARENT_RUN_ID.to_string(), json!(parent_run_id));
        metadata.insert(keys::SUBGRAPH_PATH.to_string(), json!(path));
        metadata.insert(keys::SUBGRAPH_ENTERED_AT.to_string(), json!(Utc::now()));

        Message {
            id: Uuid::new_v4().to_string(),
            content: parent.content.clone(),
            from: parent.from.clone(),
            to: parent.to.clone(),
            state: MessageState::Ready,
            state_history: Vec::new(),
            data,
            metadata,
            tool_calls: Vec::new(),
            graph_id: Some(self.child.id().to_string()),
            node_id: None,
            run_id: Some(child_run_id.to_string()),
        }
    }

    /// Wrap a child pause into a parent-level WAITING message with the
    /// subgraph stack, outermost context first
    fn propagate_pause(
        &self,
        parent: &Message,
        child: Message,
        parent_run_id: &str,
        parent_graph_id: &str,
        child_run_id: &str,
        depth: u32,
    ) -> Message {
        let context = SubgraphCheckpointContext {
            parent_node_id: self.id.clone(),
            parent_graph_id: parent_graph_id.to_string(),
            parent_run_id: parent_run_id.to_string(),
            child_graph_id: self.child.id().to_string(),
            child_node_id: child.node_id.clone().unwrap_or_default(),
            child_run_id: child_run_id.to_string(),
            output_mapping: self.output_mapping.clone(),
            depth,
        };

        let mut stack = vec![context];
        stack.extend(read_stack(&child));

        let mut result = parent.clone();
        result.data.extend(child.data.clone());
        for (key, value) in &child.metadata {
            if !is_internal_metadata(key) {
                result.metadata.insert(key.clone(), value.clone());
            }
        }
        result.metadata.insert(
            keys::SUBGRAPH_STACK.to_string(),
            serde_json::to_value(&stack).unwrap_or(Value::Null),
        );
        result.tool_calls = child.tool_calls;
        result.content = child.content;
        result.node_id = Some(self.id.clone());

        tracing::info!(
            node_id = %self.id,
            child_graph_id = self.child.id(),
            stack_depth = stack.len(),
            "subgraph paused, propagating to parent"
        );

        result.transition_to(MessageState::Waiting, "subgraph paused")
    }

    /// Fold a completed child back into the parent message
    fn merge_child_completion(&self, parent: &Message, child: Message, elapsed_ms: i64) -> Message {
        let mut result = parent.clone();
        result.data = merge_child_output(&parent.data, &child.data, &self.output_mapping);
        result.content = child.content;
        result.tool_calls = child.tool_calls;
        result.node_id = Some(self.id.clone());
        result
            .metadata
            .insert(keys::LAST_SUBGRAPH_DURATION.to_string(), json!(elapsed_ms));
        result
            .metadata
            .insert(keys::LAST_SUBGRAPH_ID.to_string(), json!(self.child.id()));
        result.metadata.insert(
            keys::LAST_SUBGRAPH_STATE.to_string(),
            json!(child.state.to_string()),
        );
        result
    }
}

/// Parse the subgraph stack out of message metadata
pub(crate) fn read_stack(message: &Message) -> Vec<SubgraphCheckpointContext> {
    message
        .metadata
        .get(keys::SUBGRAPH_STACK)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default()
}

fn is_internal_metadata(key: &str) -> bool {
    key.starts_with("__")
        || matches!(
            key,
            keys::SUBGRAPH_DEPTH
                | keys::PARENT_GRAPH_ID
                | keys::PARENT_RUN_ID
                | keys::SUBGRAPH_PATH
                | keys::SUBGRAPH_ENTERED_AT
        )
}

/// Output-mapping merge: renamed child values override parent data, unmapped
/// child keys fill the rest, untouched parent keys survive
pub(crate) fn merge_child_output(
    parent_data: &HashMap<String, Value>,
    child_data: &HashMap<String, Value>,
    output_mapping: &HashMap<String, String>,
) -> HashMap<String, Value> {
    let mut merged = parent_data.clone();
    for (key, value) in child_data {
        if !output_mapping.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    for (child_key, parent_key) in output_mapping {
        if let Some(value) = child_data.get(child_key) {
            merged.insert(parent_key.clone(), value.clone());
        }
    }
    merged
}

#[async_trait]
impl Node for SubgraphNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, _message: Message) -> SpiceResult<Message> {
        // The runner dispatches through run_with_runner; a direct call has
        // no runner to execute the child with.
        Err(SpiceError::execution(format!(
            "subgraph node '{}' must be executed through a GraphRunner",
            self.id
        )))
    }

    fn as_subgraph(&self) -> Option<&SubgraphNode> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(entries: &[(&str, Value)]) -> HashMap<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_merge_child_output_priorities() {
        let parent = data(&[("keep", json!(1)), ("shared", json!("parent"))]);
        let child = data(&[("shared", json!("child")), ("result", json!(42))]);
        let mapping = HashMap::from([("result".to_string(), "final".to_string())]);

        let merged = merge_child_output(&parent, &child, &mapping);

        assert_eq!(merged["keep"], json!(1)); // untouched parent key survives
        assert_eq!(merged["shared"], json!("child")); // unmapped child key wins
        assert_eq!(merged["final"], json!(42)); // renamed
        assert!(!merged.contains_key("result")); // renamed keys are not duplicated
    }

    #[test]
    fn test_merge_child_output_is_idempotent() {
        let parent = data(&[("a", json!(1))]);
        let child = data(&[("b", json!(2)), ("r", json!(3))]);
        let mapping = HashMap::from([("r".to_string(), "renamed".to_string())]);

        let once = merge_child_output(&parent, &child, &mapping);
        let twice = merge_child_output(&once, &child, &mapping);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_internal_metadata_filter() {
        assert!(is_internal_metadata(keys::SUBGRAPH_STACK));
        assert!(is_internal_metadata(keys::SUBGRAPH_DEPTH));
        assert!(is_internal_metadata("__private"));
        assert!(!is_internal_metadata("traceId"));
        assert!(!is_internal_metadata(keys::PAUSED_NODE_ID));
    }
}
