//! Tool contract and tool-backed node
//!
//! A [`Tool`] is a named, schema-described function the graph can invoke.
//! [`ToolNode`] wires one tool into the traversal: arguments come from the
//! first pending tool-call whose name matches the tool, falling back to the
//! message `data` bag, and the result lands back in `data`.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use spice_core::error::SpiceResult;
//! use spice_core::node::{Tool, ToolResult};
//! use std::collections::HashMap;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Tool for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     fn parameters_schema(&self) -> Value {
//!         json!({
//!             "type": "object",
//!             "properties": {"text": {"type": "string"}},
//!             "required": ["text"]
//!         })
//!     }
//!
//!     async fn execute(&self, params: HashMap<String, Value>) -> SpiceResult<ToolResult> {
//!         let text = params.get("text").cloned().unwrap_or(Value::Null);
//!         Ok(ToolResult::new(text))
//!     }
//! }
//!
//! let spec = Echo.to_openai_function_spec(false);
//! assert_eq!(spec["function"]["name"], json!("echo"));
//! ```

use crate::error::{SpiceError, SpiceResult};
use crate::keys;
use crate::message::Message;
use crate::node::Node;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of a tool execution
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// The produced value
    pub output: Value,

    /// Optional execution metadata (timings, provenance, ...)
    pub metadata: HashMap<String, Value>,
}

impl ToolResult {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A callable, schema-described capability
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name; matches tool-call names on the message
    fn name(&self) -> &str;

    /// Human-readable description for function-spec export
    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema of the accepted parameters
    fn parameters_schema(&self) -> Value;

    /// Cheap pre-validation before `execute`
    fn can_execute(&self, _params: &HashMap<String, Value>) -> bool {
        true
    }

    /// Execute with named parameters
    async fn execute(&self, params: HashMap<String, Value>) -> SpiceResult<ToolResult>;

    /// Export as an OpenAI-style function spec
    fn to_openai_function_spec(&self, strict: bool) -> Value {
        let mut function = json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": self.parameters_schema(),
        });
        if strict {
            function["strict"] = json!(true);
        }
        json!({
            "type": "function",
            "function": function,
        })
    }
}

/// Node wrapping a [`Tool`]
pub struct ToolNode {
    id: String,
    tool: Arc<dyn Tool>,
}

impl ToolNode {
    pub fn new(id: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        Self {
            id: id.into(),
            tool,
        }
    }

    /// Parameters for this invocation: the matching pending tool-call's
    /// arguments win; otherwise the whole `data` bag is passed
    fn resolve_params(&self, message: &Message) -> (HashMap<String, Value>, Option<String>) {
        if let Some(tool_call) = message.find_tool_call(self.tool.name()) {
            let params = tool_call
                .arguments
                .as_object()
                .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            return (params, Some(tool_call.id.clone()));
        }
        (message.data.clone(), None)
    }
}

#[async_trait]
impl Node for ToolNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, message: Message) -> SpiceResult<Message> {
        let (params, consumed_call_id) = self.resolve_params(&message);

        if !self.tool.can_execute(&params) {
            return Err(SpiceError::validation(format!(
                "tool '{}' rejected parameters",
                self.tool.name()
            ))
            .with_context("toolName", json!(self.tool.name())));
        }

        // Errors pass through untransformed; only context is added.
        let result = self
            .tool
            .execute(params)
            .await
            .map_err(|e| e.with_context("toolName", json!(self.tool.name())))?;

        tracing::debug!(node_id = %self.id, tool = %self.tool.name(), "tool executed");

        let mut output = message
            .with_data(format!("{}_result", self.tool.name()), result.output.clone())
            .with_data(keys::LAST_TOOL_RESULT, result.output.clone());

        if let Some(id) = consumed_call_id {
            output = output.without_tool_call(&id);
        }
        if let Some(text) = result.output.as_str() {
            output = output.with_content(text);
        }
        Ok(output)
    }
}
