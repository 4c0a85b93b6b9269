//! Middleware transformer chain around graph and node execution
//!
//! [`Transformer`]s hook four points: before the whole execution, before
//! each node, after each node, and after the whole execution. Each hook
//! takes the current message and returns a new one; transformers compose
//! left-to-right, the output of transformer *i* feeding *i+1*.
//!
//! A transformer declares `continue_on_failure`. When `false` (the default)
//! a hook failure aborts the chain and the run; when `true` the chain
//! continues with the last successful message and the failure is logged.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use spice_core::error::SpiceResult;
//! use spice_core::graph::Graph;
//! use spice_core::message::Message;
//! use spice_core::transform::Transformer;
//! use serde_json::json;
//!
//! struct Stamp;
//!
//! #[async_trait]
//! impl Transformer for Stamp {
//!     fn name(&self) -> &str {
//!         "stamp"
//!     }
//!
//!     async fn before_node(
//!         &self,
//!         _graph: &Graph,
//!         node_id: &str,
//!         message: Message,
//!     ) -> SpiceResult<Message> {
//!         Ok(message.with_metadata("lastVisited", json!(node_id)))
//!     }
//! }
//! ```

use crate::error::SpiceResult;
use crate::graph::Graph;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;

/// Before/after hooks around graph and per-node execution
///
/// Default implementations pass the message through untouched, so a
/// transformer only implements the hooks it cares about.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Name used in logs and failure context
    fn name(&self) -> &str;

    /// When true, a failing hook is skipped instead of aborting the run
    fn continue_on_failure(&self) -> bool {
        false
    }

    async fn before_execution(&self, _graph: &Graph, message: Message) -> SpiceResult<Message> {
        Ok(message)
    }

    async fn before_node(
        &self,
        _graph: &Graph,
        _node_id: &str,
        message: Message,
    ) -> SpiceResult<Message> {
        Ok(message)
    }

    async fn after_node(
        &self,
        _graph: &Graph,
        _node_id: &str,
        _input: &Message,
        output: Message,
    ) -> SpiceResult<Message> {
        Ok(output)
    }

    async fn after_execution(
        &self,
        _graph: &Graph,
        _input: &Message,
        output: Message,
    ) -> SpiceResult<Message> {
        Ok(output)
    }
}

/// Ordered transformer pipeline
#[derive(Clone, Default)]
pub struct TransformerChain {
    transformers: Vec<Arc<dyn Transformer>>,
}

impl TransformerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    pub async fn before_execution(&self, graph: &Graph, message: Message) -> SpiceResult<Message> {
        let mut current = message;
        for transformer in &self.transformers {
            let attempt = transformer.before_execution(graph, current.clone()).await;
            current = Self::step(transformer.as_ref(), current, attempt)?;
        }
        Ok(current)
    }

    pub async fn before_node(
        &self,
        graph: &Graph,
        node_id: &str,
        message: Message,
    ) -> SpiceResult<Message> {
        let mut current = message;
        for transformer in &self.transformers {
            let attempt = transformer.before_node(graph, node_id, current.clone()).await;
            current = Self::step(transformer.as_ref(), current, attempt)?;
        }
        Ok(current)
    }

    pub async fn after_node(
        &self,
        graph: &Graph,
        node_id: &str,
        input: &Message,
        output: Message,
    ) -> SpiceResult<Message> {
        let mut current = output;
        for transformer in &self.transformers {
            let attempt = transformer
                .after_node(graph, node_id, input, current.clone())
                .await;
            current = Self::step(transformer.as_ref(), current, attempt)?;
        }
        Ok(current)
    }

    pub async fn after_execution(
        &self,
        graph: &Graph,
        input: &Message,
        output: Message,
    ) -> SpiceResult<Message> {
        let mut current = output;
        for transformer in &self.transformers {
            let attempt = transformer
                .after_execution(graph, input, current.clone())
                .await;
            current = Self::step(transformer.as_ref(), current, attempt)?;
        }
        Ok(current)
    }

    fn step(
        transformer: &dyn Transformer,
        fallback: Message,
        result: SpiceResult<Message>,
    ) -> SpiceResult<Message> {
        match result {
            Ok(next) => Ok(next),
            Err(err) if transformer.continue_on_failure() => {
                tracing::warn!(
                    transformer = transformer.name(),
                    error = %err,
                    "transformer failed, continuing with last message"
                );
                Ok(fallback)
            }
            Err(err) => Err(err),
        }
    }
}

/// Transformer that logs node and execution boundaries
#[derive(Debug, Clone, Default)]
pub struct LoggingTransformer;

impl LoggingTransformer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transformer for LoggingTransformer {
    fn name(&self) -> &str {
        "logging"
    }

    fn continue_on_failure(&self) -> bool {
        true
    }

    async fn before_execution(&self, graph: &Graph, message: Message) -> SpiceResult<Message> {
        tracing::info!(graph_id = graph.id(), message_id = %message.id, "execution starting");
        Ok(message)
    }

    async fn before_node(
        &self,
        graph: &Graph,
        node_id: &str,
        message: Message,
    ) -> SpiceResult<Message> {
        tracing::debug!(graph_id = graph.id(), node_id, state = %message.state, "entering node");
        Ok(message)
    }

    async fn after_node(
        &self,
        graph: &Graph,
        node_id: &str,
        _input: &Message,
        output: Message,
    ) -> SpiceResult<Message> {
        tracing::debug!(graph_id = graph.id(), node_id, state = %output.state, "leaving node");
        Ok(output)
    }

    async fn after_execution(
        &self,
        graph: &Graph,
        _input: &Message,
        output: Message,
    ) -> SpiceResult<Message> {
        tracing::info!(graph_id = graph.id(), state = %output.state, "execution finished");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpiceError;
    use crate::node::OutputNode;
    use serde_json::json;

    fn graph() -> Graph {
        Graph::builder("g")
            .add_node(OutputNode::new("out"))
            .with_entry_point("out")
            .build()
            .unwrap()
    }

    struct Tag(&'static str);

    #[async_trait]
    impl Transformer for Tag {
        fn name(&self) -> &str {
            self.0
        }

        async fn before_node(
            &self,
            _graph: &Graph,
            _node_id: &str,
            message: Message,
        ) -> SpiceResult<Message> {
            let trail = message.data_str("trail").unwrap_or("").to_string();
            Ok(message.with_data("trail", json!(format!("{}{}", trail, self.0))))
        }
    }

    struct Fails {
        continue_on_failure: bool,
    }

    #[async_trait]
    impl Transformer for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        fn continue_on_failure(&self) -> bool {
            self.continue_on_failure
        }

        async fn before_node(
            &self,
            _graph: &Graph,
            _node_id: &str,
            _message: Message,
        ) -> SpiceResult<Message> {
            Err(SpiceError::unknown("hook broke"))
        }
    }

    #[tokio::test]
    async fn test_left_to_right_composition() {
        let chain = TransformerChain::new()
            .push(Arc::new(Tag("a")))
            .push(Arc::new(Tag("b")));

        let out = chain
            .before_node(&graph(), "n", Message::new(""))
            .await
            .unwrap();
        assert_eq!(out.data_str("trail"), Some("ab"));
    }

    #[tokio::test]
    async fn test_failure_aborts_chain() {
        let chain = TransformerChain::new()
            .push(Arc::new(Fails {
                continue_on_failure: false,
            }))
            .push(Arc::new(Tag("never")));

        let err = chain
            .before_node(&graph(), "n", Message::new(""))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UnknownError");
    }

    #[tokio::test]
    async fn test_continue_on_failure_uses_last_message() {
        let chain = TransformerChain::new()
            .push(Arc::new(Tag("a")))
            .push(Arc::new(Fails {
                continue_on_failure: true,
            }))
            .push(Arc::new(Tag("c")));

        let out = chain
            .before_node(&graph(), "n", Message::new(""))
            .await
            .unwrap();
        assert_eq!(out.data_str("trail"), Some("ac"));
    }
}
