//! Well-known data and metadata keys
//!
//! The engine communicates through the message's `data` and `metadata` bags
//! using the string keys collected here. Keys beginning with `_` and the
//! reserved metadata set below are framework-owned; application code should
//! treat them as read-only.

/// Data key: target node chosen by a decision node
pub const SELECTED_BRANCH: &str = "_selectedBranch";

/// Data key: name of the branch a decision node chose
pub const BRANCH_NAME: &str = "_branchName";

/// Data key: id of the decision node that made the choice
pub const DECISION_NODE_ID: &str = "_decisionNodeId";

/// Data key: value produced by an output node
pub const OUTPUT: &str = "output";

/// Data key: free-text portion of a user response
pub const RESPONSE_TEXT: &str = "response_text";

/// Data key: structured portion of a user response
pub const STRUCTURED_RESPONSE: &str = "structured_response";

/// Data key: option id selected in a `request_user_selection` response
pub const SELECTED_OPTION: &str = "selected_option";

/// Data key: the full user-response tool-call, kept for audit
pub const USER_RESPONSE_TOOL_CALL: &str = "user_response_tool_call";

/// Data key: result of the most recent tool execution
pub const LAST_TOOL_RESULT: &str = "last_tool_result";

/// Metadata key: pending parent contexts of nested subgraph pauses
pub const SUBGRAPH_STACK: &str = "__subgraphStack";

/// Metadata key: current subgraph nesting depth
pub const SUBGRAPH_DEPTH: &str = "subgraphDepth";

/// Metadata key: graph id of the enclosing parent
pub const PARENT_GRAPH_ID: &str = "parentGraphId";

/// Metadata key: run id of the enclosing parent
pub const PARENT_RUN_ID: &str = "parentRunId";

/// Metadata key: slash-joined path of subgraph ids entered so far
pub const SUBGRAPH_PATH: &str = "subgraphPath";

/// Metadata key: timestamp of the most recent subgraph entry
pub const SUBGRAPH_ENTERED_AT: &str = "subgraphEnteredAt";

/// Metadata key: wall-clock duration of the last completed subgraph (ms)
pub const LAST_SUBGRAPH_DURATION: &str = "lastSubgraphDuration";

/// Metadata key: graph id of the last completed subgraph
pub const LAST_SUBGRAPH_ID: &str = "lastSubgraphId";

/// Metadata key: final state of the last completed subgraph
pub const LAST_SUBGRAPH_STATE: &str = "lastSubgraphState";

/// Metadata key: node that paused the run
pub const PAUSED_NODE_ID: &str = "paused_node_id";

/// Metadata key: when the run paused
pub const PAUSED_AT: &str = "paused_at";

/// Tool-call name: enumerated-choice prompt emitted by a human node
pub const REQUEST_USER_SELECTION: &str = "request_user_selection";

/// Tool-call name: free-form question emitted by a human node
pub const REQUEST_USER_INPUT: &str = "request_user_input";

/// Tool-call name: answer supplied by the resume caller
pub const USER_RESPONSE: &str = "user_response";

/// Metadata keys copied from parent to child when entering a subgraph
pub const PRESERVED_METADATA_KEYS: &[&str] = &[
    "userId",
    "tenantId",
    "traceId",
    "spanId",
    "sessionToken",
    "correlationId",
    "isLoggedIn",
];

/// Metadata keys owned by the framework
pub const RESERVED_METADATA_KEYS: &[&str] = &[
    SUBGRAPH_STACK,
    SUBGRAPH_DEPTH,
    PARENT_GRAPH_ID,
    PARENT_RUN_ID,
    SUBGRAPH_PATH,
    SUBGRAPH_ENTERED_AT,
    LAST_SUBGRAPH_DURATION,
    LAST_SUBGRAPH_ID,
    LAST_SUBGRAPH_STATE,
    PAUSED_NODE_ID,
    PAUSED_AT,
];

/// Whether a metadata key is framework-owned
pub fn is_reserved_metadata_key(key: &str) -> bool {
    key.starts_with('_') || RESERVED_METADATA_KEYS.contains(&key)
}
