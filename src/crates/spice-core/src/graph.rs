//! Graph - immutable workflow definition
//!
//! A [`Graph`] is nodes plus directed [`Edge`]s, an entry point, and the
//! per-graph configuration (checkpoint store, event bus, retry policy). It is
//! read-only after [`GraphBuilder::build`]; the builder validates structure
//! so the runner never encounters dangling references.
//!
//! # Edge Semantics
//!
//! Edges originating from the same node are evaluated in **declared order**;
//! the first whose condition holds wins. A condition defaults to
//! "always". The virtual sink [`Graph::END`] is a legal edge target that
//! completes the run.
//!
//! # Example
//!
//! ```rust
//! use spice_core::graph::Graph;
//! use spice_core::node::OutputNode;
//!
//! let graph = Graph::builder("hello")
//!     .add_node(OutputNode::new("out"))
//!     .with_entry_point("out")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(graph.entry_point(), "out");
//! ```

use crate::error::{SpiceError, SpiceResult};
use crate::events::EventBus;
use crate::message::Message;
use crate::node::Node;
use crate::retry::RetryPolicy;
use spice_checkpoint::CheckpointStore;
use std::collections::HashMap;
use std::sync::Arc;

/// Edge condition over the in-flight message
pub type EdgeCondition = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Directed connection with an optional predicate
#[derive(Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    condition: Option<EdgeCondition>,
}

impl Edge {
    /// Unconditional edge
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    /// Edge taken only when the condition holds
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        condition: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Some(Arc::new(condition)),
        }
    }

    /// Whether this edge accepts the message
    pub fn matches(&self, message: &Message) -> bool {
        match &self.condition {
            Some(condition) => condition(message),
            None => true,
        }
    }

    /// Whether a non-default condition is attached
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

/// Per-graph wiring of shared collaborators
#[derive(Clone, Default)]
pub struct GraphConfig {
    /// Store used when this graph's runs pause
    pub checkpoint_store: Option<Arc<dyn CheckpointStore>>,

    /// Sink for lifecycle and tool-call events
    pub event_bus: Option<Arc<dyn EventBus>>,

    /// Retry policy for node attempts; engine default when absent
    pub retry_policy: Option<RetryPolicy>,
}

impl std::fmt::Debug for GraphConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphConfig")
            .field("has_checkpoint_store", &self.checkpoint_store.is_some())
            .field("has_event_bus", &self.event_bus.is_some())
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

/// Immutable workflow definition
pub struct Graph {
    id: String,
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: Vec<Edge>,
    entry_point: String,
    config: GraphConfig,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut node_ids: Vec<&str> = self.node_ids().collect();
        node_ids.sort_unstable();
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("entry_point", &self.entry_point)
            .field("nodes", &node_ids)
            .field("edges", &self.edges)
            .finish()
    }
}

impl Graph {
    /// Virtual sink; an edge to `END` completes the run
    pub const END: &'static str = "__end__";

    pub fn builder(id: impl Into<String>) -> GraphBuilder {
        GraphBuilder {
            id: id.into(),
            nodes: HashMap::new(),
            node_order: Vec::new(),
            edges: Vec::new(),
            entry_point: None,
            config: GraphConfig::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn node(&self, id: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Outgoing edges of a node, in declared order
    pub fn edges_from<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |edge| edge.from == node_id)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Render the topology as a Mermaid flowchart for debugging
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");
        for edge in &self.edges {
            if edge.is_conditional() {
                out.push_str(&format!("    {} -.->|cond| {}\n", edge.from, edge.to));
            } else {
                out.push_str(&format!("    {} --> {}\n", edge.from, edge.to));
            }
        }
        for id in self.nodes.keys() {
            if !self.edges.iter().any(|e| e.from == *id || e.to == *id) {
                out.push_str(&format!("    {}\n", id));
            }
        }
        out
    }
}

/// Validating builder for [`Graph`]
pub struct GraphBuilder {
    id: String,
    nodes: HashMap<String, Arc<dyn Node>>,
    node_order: Vec<String>,
    edges: Vec<Edge>,
    entry_point: Option<String>,
    config: GraphConfig,
}

impl GraphBuilder {
    /// Add a node; its `id()` becomes the vertex name
    pub fn add_node(self, node: impl Node + 'static) -> Self {
        self.add_shared_node(Arc::new(node))
    }

    /// Add an already-shared node
    pub fn add_shared_node(mut self, node: Arc<dyn Node>) -> Self {
        let id = node.id().to_string();
        self.node_order.push(id.clone());
        self.nodes.insert(id, node);
        self
    }

    /// Unconditional edge; declared order is evaluation order
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    /// Conditional edge
    pub fn add_conditional_edge(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.edges.push(Edge::conditional(from, to, condition));
        self
    }

    pub fn with_entry_point(mut self, node_id: impl Into<String>) -> Self {
        self.entry_point = Some(node_id.into());
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.config.checkpoint_store = Some(store);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.config.event_bus = Some(bus);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = Some(policy);
        self
    }

    /// Validate and freeze the graph
    pub fn build(self) -> SpiceResult<Graph> {
        let mut seen = std::collections::HashSet::new();
        for id in &self.node_order {
            if !seen.insert(id.clone()) {
                return Err(SpiceError::validation(format!(
                    "graph '{}': duplicate node id '{}'",
                    self.id, id
                )));
            }
        }

        let entry_point = self.entry_point.ok_or_else(|| {
            SpiceError::validation(format!("graph '{}': entry point not set", self.id))
        })?;
        if !self.nodes.contains_key(&entry_point) {
            return Err(SpiceError::validation(format!(
                "graph '{}': entry point '{}' does not exist",
                self.id, entry_point
            )));
        }

        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.from) {
                return Err(SpiceError::validation(format!(
                    "graph '{}': edge source '{}' does not exist",
                    self.id, edge.from
                )));
            }
            if edge.to != Graph::END && !self.nodes.contains_key(&edge.to) {
                return Err(SpiceError::validation(format!(
                    "graph '{}': edge target '{}' does not exist",
                    self.id, edge.to
                )));
            }
        }

        Ok(Graph {
            id: self.id,
            nodes: self.nodes,
            edges: self.edges,
            entry_point,
            config: self.config,
        })
    }
}
