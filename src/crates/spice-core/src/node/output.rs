//! Output node - declared terminal sink
//!
//! Reaching an [`OutputNode`] with no matching outgoing edge completes the
//! run. An optional producer function derives the final value from the
//! message; it lands in `data.output`.

use crate::error::SpiceResult;
use crate::keys;
use crate::message::Message;
use crate::node::Node;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

type OutputProducer = Arc<dyn Fn(&Message) -> Value + Send + Sync>;

/// Terminal node with an optional data producer
#[derive(Clone)]
pub struct OutputNode {
    id: String,
    producer: Option<OutputProducer>,
}

impl std::fmt::Debug for OutputNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputNode")
            .field("id", &self.id)
            .field("has_producer", &self.producer.is_some())
            .finish()
    }
}

impl OutputNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            producer: None,
        }
    }

    pub fn with_producer(
        id: impl Into<String>,
        producer: impl Fn(&Message) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            producer: Some(Arc::new(producer)),
        }
    }
}

#[async_trait]
impl Node for OutputNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_output(&self) -> bool {
        true
    }

    async fn run(&self, message: Message) -> SpiceResult<Message> {
        match &self.producer {
            Some(producer) => {
                let value = producer(&message);
                Ok(message.with_data(keys::OUTPUT, value))
            }
            None => Ok(message),
        }
    }
}
