//! Decision node - deterministic branch selection
//!
//! A [`DecisionNode`] evaluates its branches in declared order and records
//! the first match in the message's data bag under `_selectedBranch` (plus
//! `_branchName` and `_decisionNodeId`). It never touches `content` and has
//! no side effects; downstream edges route on the recorded keys.
//!
//! `otherwise()` installs an always-true sentinel branch; at most one is
//! allowed and the builder rejects a second.
//!
//! # Example
//!
//! ```rust
//! use spice_core::node::DecisionNode;
//!
//! let node = DecisionNode::builder("route")
//!     .branch("is-a", "handler-a", |m| Ok(m.data_str("type") == Some("A")))
//!     .branch("is-b", "handler-b", |m| Ok(m.data_str("type") == Some("B")))
//!     .otherwise("fallback")
//!     .build()
//!     .unwrap();
//! ```

use crate::error::{SpiceError, SpiceResult};
use crate::keys;
use crate::message::Message;
use crate::node::Node;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Branch predicate; errors are surfaced as `ExecutionError`
pub type BranchPredicate = Arc<dyn Fn(&Message) -> SpiceResult<bool> + Send + Sync>;

/// One candidate route out of a decision node
#[derive(Clone)]
pub struct DecisionBranch {
    pub name: String,
    pub target_node_id: String,
    predicate: BranchPredicate,
    is_otherwise: bool,
}

impl std::fmt::Debug for DecisionBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionBranch")
            .field("name", &self.name)
            .field("target_node_id", &self.target_node_id)
            .field("is_otherwise", &self.is_otherwise)
            .finish()
    }
}

/// Branch-selection node
#[derive(Debug)]
pub struct DecisionNode {
    id: String,
    branches: Vec<DecisionBranch>,
}

impl DecisionNode {
    pub fn builder(id: impl Into<String>) -> DecisionNodeBuilder {
        DecisionNodeBuilder {
            id: id.into(),
            branches: Vec::new(),
            has_otherwise: false,
        }
    }

    pub fn branches(&self) -> &[DecisionBranch] {
        &self.branches
    }
}

/// Builder enforcing the single-`otherwise` rule at build time
pub struct DecisionNodeBuilder {
    id: String,
    branches: Vec<DecisionBranch>,
    has_otherwise: bool,
}

impl DecisionNodeBuilder {
    /// Add a predicate branch; declared order is evaluation order
    pub fn branch(
        mut self,
        name: impl Into<String>,
        target_node_id: impl Into<String>,
        predicate: impl Fn(&Message) -> SpiceResult<bool> + Send + Sync + 'static,
    ) -> Self {
        self.branches.push(DecisionBranch {
            name: name.into(),
            target_node_id: target_node_id.into(),
            predicate: Arc::new(predicate),
            is_otherwise: false,
        });
        self
    }

    /// Add the always-true fallback branch
    pub fn otherwise(mut self, target_node_id: impl Into<String>) -> Self {
        self.branches.push(DecisionBranch {
            name: "otherwise".to_string(),
            target_node_id: target_node_id.into(),
            predicate: Arc::new(|_| Ok(true)),
            is_otherwise: true,
        });
        self
    }

    pub fn build(self) -> SpiceResult<DecisionNode> {
        let otherwise_count = self.branches.iter().filter(|b| b.is_otherwise).count();
        if otherwise_count > 1 {
            return Err(SpiceError::validation(format!(
                "decision node '{}' declares {} otherwise branches, at most one is allowed",
                self.id, otherwise_count
            )));
        }
        if self.branches.is_empty() {
            return Err(SpiceError::validation(format!(
                "decision node '{}' has no branches",
                self.id
            )));
        }
        if let Some(pos) = self.branches.iter().position(|b| b.is_otherwise) {
            if pos != self.branches.len() - 1 {
                return Err(SpiceError::validation(format!(
                    "decision node '{}': otherwise must be the last branch",
                    self.id
                )));
            }
        }
        Ok(DecisionNode {
            id: self.id,
            branches: self.branches,
        })
    }
}

#[async_trait]
impl Node for DecisionNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, message: Message) -> SpiceResult<Message> {
        for branch in &self.branches {
            let matched = (branch.predicate)(&message).map_err(|e| {
                SpiceError::execution("Decision branch evaluation failed")
                    .with_cause(e)
                    .with_context("decisionNodeId", json!(self.id))
                    .with_context("branchName", json!(branch.name))
            })?;

            if matched {
                tracing::debug!(
                    node_id = %self.id,
                    branch = %branch.name,
                    target = %branch.target_node_id,
                    "branch selected"
                );
                return Ok(message
                    .with_data(keys::SELECTED_BRANCH, json!(branch.target_node_id))
                    .with_data(keys::BRANCH_NAME, json!(branch.name))
                    .with_data(keys::DECISION_NODE_ID, json!(self.id)));
            }
        }

        Err(SpiceError::routing(format!(
            "decision node '{}': no branch matched",
            self.id
        )))
    }
}
