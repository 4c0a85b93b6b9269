//! Lifecycle event bus
//!
//! The runner and resume engine publish typed [`GraphEvent`]s to an
//! [`EventBus`] sink: workflow start/pause/resume/completion, node
//! boundaries, and tool-call lifecycle. Publication is fire-and-forget from
//! the engine's viewpoint; a failing or slow bus must not affect traversal.
//!
//! # Sanitization
//!
//! Event metadata can carry user and tenant context. [`EventSanitizer`]
//! filters the metadata bag before publication: an optional include set
//! (whitelist) is applied first, then the exclude set (blacklist).
//! [`EventSanitizer::with_sensitive_defaults`] pre-loads the usual credential
//! key names. Wrap any bus in a [`SanitizingEventBus`] to enforce filtering.
//!
//! # Implementations
//!
//! - [`InMemoryEventBus`] - collects events for tests and audit trails
//! - [`TracingEventBus`] - forwards to structured logs
//!
//! ```rust
//! use spice_core::events::{EventBus, EventSanitizer, GraphEvent, GraphEventKind, InMemoryEventBus, SanitizingEventBus};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let inner = Arc::new(InMemoryEventBus::new());
//! let bus = SanitizingEventBus::new(inner.clone(), EventSanitizer::with_sensitive_defaults());
//!
//! let event = GraphEvent::new(GraphEventKind::WorkflowStarted)
//!     .with_metadata("tenantId", json!("acme"))
//!     .with_metadata("apiKey", json!("sk-secret"));
//! bus.publish(event);
//!
//! let seen = inner.events();
//! assert_eq!(seen[0].metadata.get("tenantId"), Some(&json!("acme")));
//! assert!(seen[0].metadata.get("apiKey").is_none());
//! ```

use crate::message::{Message, MessageState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Keys stripped by the sensitive-defaults sanitizer preset
pub const SENSITIVE_METADATA_KEYS: &[&str] = &[
    "password",
    "apiKey",
    "token",
    "secret",
    "sessionToken",
    "accessToken",
    "refreshToken",
    "authorization",
    "credential",
    "privateKey",
];

/// What happened
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum GraphEventKind {
    WorkflowStarted,
    WorkflowCompleted { final_state: MessageState },
    WorkflowPaused,
    WorkflowResumed,
    NodeStarted,
    NodeCompleted,
    NodeFailed { error_code: String },
    ToolCallEmitted { tool_call_id: String, tool_name: String },
    ToolCallReceived { tool_call_id: String, tool_name: String },
    ToolCallCompleted { tool_call_id: String, tool_name: String },
    ToolCallFailed { tool_call_id: String, tool_name: String },
    ToolCallRetrying { attempt: u32 },
    ToolCallCancelled { tool_call_id: String, tool_name: String },
}

impl GraphEventKind {
    /// Stable name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "WorkflowStarted",
            Self::WorkflowCompleted { .. } => "WorkflowCompleted",
            Self::WorkflowPaused => "WorkflowPaused",
            Self::WorkflowResumed => "WorkflowResumed",
            Self::NodeStarted => "NodeStarted",
            Self::NodeCompleted => "NodeCompleted",
            Self::NodeFailed { .. } => "NodeFailed",
            Self::ToolCallEmitted { .. } => "ToolCallEmitted",
            Self::ToolCallReceived { .. } => "ToolCallReceived",
            Self::ToolCallCompleted { .. } => "ToolCallCompleted",
            Self::ToolCallFailed { .. } => "ToolCallFailed",
            Self::ToolCallRetrying { .. } => "ToolCallRetrying",
            Self::ToolCallCancelled { .. } => "ToolCallCancelled",
        }
    }
}

/// A lifecycle event with run coordinates and a metadata bag
#[derive(Debug, Clone, Serialize)]
pub struct GraphEvent {
    #[serde(flatten)]
    pub kind: GraphEventKind,
    pub run_id: Option<String>,
    pub graph_id: Option<String>,
    pub node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl GraphEvent {
    pub fn new(kind: GraphEventKind) -> Self {
        Self {
            kind,
            run_id: None,
            graph_id: None,
            node_id: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Fill run coordinates from a message
    pub fn for_message(mut self, message: &Message) -> Self {
        self.run_id = message.run_id.clone();
        self.graph_id = message.graph_id.clone();
        self
    }

    pub fn at_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Fire-and-forget event sink
///
/// Implementations must be `Send + Sync` and safe for concurrent use; the
/// engine never awaits delivery.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: GraphEvent);
}

/// Collecting bus for tests and audit
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    events: Mutex<Vec<GraphEvent>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far
    pub fn events(&self) -> Vec<GraphEvent> {
        self.events.lock().expect("event bus poisoned").clone()
    }

    /// Events of one kind, by stable name
    pub fn events_named(&self, name: &str) -> Vec<GraphEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.name() == name)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus poisoned").clear();
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, event: GraphEvent) {
        self.events.lock().expect("event bus poisoned").push(event);
    }
}

/// Bus that forwards events to structured logs
#[derive(Debug, Clone, Default)]
pub struct TracingEventBus;

impl TracingEventBus {
    pub fn new() -> Self {
        Self
    }
}

impl EventBus for TracingEventBus {
    fn publish(&self, event: GraphEvent) {
        tracing::info!(
            event = event.kind.name(),
            run_id = event.run_id.as_deref().unwrap_or(""),
            graph_id = event.graph_id.as_deref().unwrap_or(""),
            node_id = event.node_id.as_deref().unwrap_or(""),
            "graph event"
        );
    }
}

/// Metadata filter: include whitelist first, then exclude blacklist
#[derive(Debug, Clone, Default)]
pub struct EventSanitizer {
    include: Option<HashSet<String>>,
    exclude: HashSet<String>,
}

impl EventSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset excluding the usual credential keys
    pub fn with_sensitive_defaults() -> Self {
        Self {
            include: None,
            exclude: SENSITIVE_METADATA_KEYS
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }

    /// Restrict to an explicit whitelist
    pub fn include_only(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.include = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Add keys to the blacklist
    pub fn exclude(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Filter a metadata bag; idempotent for a fixed configuration
    pub fn sanitize(&self, metadata: HashMap<String, Value>) -> HashMap<String, Value> {
        metadata
            .into_iter()
            .filter(|(key, _)| {
                if let Some(include) = &self.include {
                    if !include.contains(key) {
                        return false;
                    }
                }
                !self.exclude.contains(key)
            })
            .collect()
    }
}

/// Bus wrapper applying a sanitizer before delegation
pub struct SanitizingEventBus {
    inner: Arc<dyn EventBus>,
    sanitizer: EventSanitizer,
}

impl SanitizingEventBus {
    pub fn new(inner: Arc<dyn EventBus>, sanitizer: EventSanitizer) -> Self {
        Self { inner, sanitizer }
    }
}

impl EventBus for SanitizingEventBus {
    fn publish(&self, mut event: GraphEvent) {
        event.metadata = self.sanitizer.sanitize(event.metadata);
        self.inner.publish(event);
    }
}
