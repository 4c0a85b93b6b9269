//! # spice-core - Graph Execution Engine for Agent Workflows
//!
//! A directed-graph workflow engine whose nodes run agents, tools,
//! human-in-the-loop prompts, decisions, and nested subgraphs. An immutable
//! [`Message`](message::Message) flows along edges; execution pauses at
//! human-input nodes into serializable checkpoints and resumes later -
//! potentially across process restarts and arbitrarily deep inside nested
//! subgraphs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ResumeEngine (spice-core::resume)                           │
//! │  execute → checkpoint on pause → resume_run(user response)   │
//! └───────────────┬──────────────────────────┬───────────────────┘
//!                 │                          │
//!                 ▼                          ▼
//! ┌───────────────────────────┐  ┌───────────────────────────────┐
//! │  GraphRunner              │  │  CheckpointStore              │
//! │  beforeNode → Node.run    │  │  (spice-checkpoint)           │
//! │  (RetrySupervisor)        │  └───────────────────────────────┘
//! │  → afterNode → edges      │
//! └───────────────┬───────────┘
//!                 │ events
//!                 ▼
//! ┌───────────────────────────┐
//! │  EventBus (+ sanitizer)   │
//! └───────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use spice_core::graph::Graph;
//! use spice_core::message::{Message, MessageState};
//! use spice_core::node::{DecisionNode, OutputNode};
//! use spice_core::runner::GraphRunner;
//! use spice_core::keys;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let route = DecisionNode::builder("route")
//!     .branch("big", "out-big", |m| Ok(m.data_i64("n").unwrap_or(0) > 10))
//!     .otherwise("out-small")
//!     .build()?;
//!
//! let graph = Graph::builder("sort")
//!     .add_node(route)
//!     .add_node(OutputNode::new("out-big"))
//!     .add_node(OutputNode::new("out-small"))
//!     .add_conditional_edge("route", "out-big", |m| {
//!         m.data_str(keys::SELECTED_BRANCH) == Some("out-big")
//!     })
//!     .add_conditional_edge("route", "out-small", |m| {
//!         m.data_str(keys::SELECTED_BRANCH) == Some("out-small")
//!     })
//!     .with_entry_point("route")
//!     .build()?;
//!
//! let result = GraphRunner::new()
//!     .execute(&graph, Message::new("x").with_data("n", json!(42)))
//!     .await?;
//!
//! assert_eq!(result.state, MessageState::Completed);
//! assert_eq!(result.data_str(keys::SELECTED_BRANCH), Some("out-big"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Map
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`message`] | Immutable message, state machine, tool-calls |
//! | [`error`] | `SpiceError` taxonomy, `SpiceResult` |
//! | [`node`] | `Node` trait + agent/tool/decision/human/subgraph/output |
//! | [`graph`] | `Graph`, `Edge`, validating builder |
//! | [`runner`] | `GraphRunner` traversal engine |
//! | [`retry`] | Policies, classifier, `RetrySupervisor`, metrics |
//! | [`resume`] | `ResumeEngine`, `ResumeOptions`, `GraphRegistry` |
//! | [`transform`] | Middleware transformer chain |
//! | [`template`] | `{{data.*}}` resolver for subgraph input mapping |
//! | [`events`] | Typed lifecycle events, buses, sanitizer |
//! | [`keys`] | Well-known data/metadata keys |

pub mod error;
pub mod events;
pub mod graph;
pub mod keys;
pub mod message;
pub mod node;
pub mod resume;
pub mod retry;
pub mod runner;
pub mod template;
pub mod transform;

pub use error::{RetryHint, SpiceError, SpiceResult};
pub use events::{
    EventBus, EventSanitizer, GraphEvent, GraphEventKind, InMemoryEventBus, SanitizingEventBus,
    TracingEventBus,
};
pub use graph::{Edge, Graph, GraphBuilder, GraphConfig};
pub use message::{Message, MessageState, StateTransition, ToolCall};
pub use node::{
    Agent, AgentNode, DecisionNode, HumanNode, Node, OutputNode, SelectionItem, SubgraphNode,
    Tool, ToolNode, ToolResult,
};
pub use resume::{GraphRegistry, ResumeEngine, ResumeOptions};
pub use retry::{
    ErrorClassifier, InMemoryRetryMetrics, RetryMetrics, RetryOutcome, RetryPolicy,
    RetrySupervisor,
};
pub use runner::GraphRunner;
pub use template::TemplateResolver;
pub use transform::{LoggingTransformer, Transformer, TransformerChain};

// Re-export the checkpoint crate so downstream users need only one import.
pub use spice_checkpoint;
