//! Human-in-the-loop node
//!
//! A [`HumanNode`] is a suspension point: it emits a user-facing prompt as a
//! tool-call and transitions the message to WAITING. It never completes a run
//! by itself; the resume path merges the user's answer and continues along
//! the node's outgoing edges.
//!
//! Two prompt shapes exist, chosen at construction:
//!
//! - **Selection** (`request_user_selection`) - an enumerated choice with
//!   optional free-text escape hatch
//! - **Input** (`request_user_input`) - a free-form question
//!
//! Every invocation emits a tool-call with a fresh unique id, so repeated
//! pauses at the same node stay distinguishable in the event stream.

use crate::error::SpiceResult;
use crate::keys;
use crate::message::{Message, MessageState, ToolCall};
use crate::node::Node;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// One enumerated choice offered by a selection prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionItem {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl SelectionItem {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: None,
            metadata: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone)]
enum Prompt {
    Selection {
        prompt_message: String,
        items: Vec<SelectionItem>,
        allow_free_text: bool,
        expires_at: Option<DateTime<Utc>>,
    },
    Input {
        question: String,
        input_type: String,
        context: HashMap<String, Value>,
    },
}

/// Suspension-point node awaiting user input
#[derive(Debug)]
pub struct HumanNode {
    id: String,
    prompt: Prompt,
}

impl HumanNode {
    /// Enumerated-choice prompt
    pub fn selection(
        id: impl Into<String>,
        prompt_message: impl Into<String>,
        items: Vec<SelectionItem>,
    ) -> Self {
        Self {
            id: id.into(),
            prompt: Prompt::Selection {
                prompt_message: prompt_message.into(),
                items,
                allow_free_text: false,
                expires_at: None,
            },
        }
    }

    /// Free-form question prompt
    pub fn input(
        id: impl Into<String>,
        question: impl Into<String>,
        input_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            prompt: Prompt::Input {
                question: question.into(),
                input_type: input_type.into(),
                context: HashMap::new(),
            },
        }
    }

    /// Allow a free-text answer alongside the enumerated items
    pub fn with_free_text(mut self) -> Self {
        if let Prompt::Selection {
            allow_free_text, ..
        } = &mut self.prompt
        {
            *allow_free_text = true;
        }
        self
    }

    /// Expiry advertised to the prompt renderer
    pub fn with_expires_at(mut self, at: DateTime<Utc>) -> Self {
        if let Prompt::Selection { expires_at, .. } = &mut self.prompt {
            *expires_at = Some(at);
        }
        self
    }

    /// Extra context entries for input prompts
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        if let Prompt::Input { context, .. } = &mut self.prompt {
            context.insert(key.into(), value);
        }
        self
    }

    fn build_tool_call(&self) -> ToolCall {
        match &self.prompt {
            Prompt::Selection {
                prompt_message,
                items,
                allow_free_text,
                expires_at,
            } => {
                let mut metadata = json!({
                    "node_id": self.id,
                    "allow_free_text": allow_free_text,
                });
                if let Some(at) = expires_at {
                    metadata["expires_at"] = json!(at);
                }
                ToolCall::new(
                    keys::REQUEST_USER_SELECTION,
                    json!({
                        "prompt_message": prompt_message,
                        "items": items,
                        "metadata": metadata,
                    }),
                )
            }
            Prompt::Input {
                question,
                input_type,
                context,
            } => {
                let mut full_context = json!({ "node_id": self.id });
                for (key, value) in context {
                    full_context[key] = value.clone();
                }
                ToolCall::new(
                    keys::REQUEST_USER_INPUT,
                    json!({
                        "question": question,
                        "type": input_type,
                        "context": full_context,
                    }),
                )
            }
        }
    }
}

#[async_trait]
impl Node for HumanNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, message: Message) -> SpiceResult<Message> {
        let tool_call = self.build_tool_call();
        tracing::info!(
            node_id = %self.id,
            tool_call_id = %tool_call.id,
            prompt = %tool_call.name,
            "pausing for user input"
        );

        Ok(message
            .with_tool_call(tool_call)
            .with_metadata(keys::PAUSED_NODE_ID, json!(self.id))
            .with_metadata(keys::PAUSED_AT, json!(Utc::now()))
            .transition_to(MessageState::Waiting, "awaiting user input"))
    }
}
