//! Error taxonomy and result type for graph execution
//!
//! Every fallible engine operation returns [`SpiceResult`], whose error arm
//! is the [`SpiceError`] taxonomy. Each error kind carries a stable string
//! `code`, a human-readable message, an optional preserved `cause`, and an
//! arbitrary `context` bag used for structured logging and for the retry
//! supervisor's classification decisions.
//!
//! # Error Hierarchy
//!
//! ```text
//! SpiceError
//! ├── Validation        - Bad input, expired checkpoints, build-time checks
//! ├── Authentication    - Credential failures (never retried)
//! ├── Network           - Transport failures, optional HTTP status
//! ├── Timeout           - Operation exceeded its deadline
//! ├── RateLimit         - Throttled, optional retry-after hint
//! ├── Serialization     - JSON (de)serialization failures
//! ├── Configuration     - Invalid engine or node configuration
//! ├── Tool              - Tool execution failures
//! ├── ToolLookup        - Unknown tool name
//! ├── Routing           - No edge matched and node is not terminal
//! ├── Agent             - Agent execution failures
//! ├── Execution         - Node/graph execution wrapper, preserves cause
//! ├── Checkpoint        - Persistence failures
//! ├── Retryable         - Explicitly retryable, optional hint
//! └── Unknown           - Anything else
//! ```
//!
//! # Context Enrichment
//!
//! Errors are never transformed into success; they are enriched on the way
//! up. [`SpiceError::with_context`] returns a copy with an extra context
//! entry, so intermediate layers can annotate without losing the original:
//!
//! ```rust
//! use spice_core::error::SpiceError;
//! use serde_json::json;
//!
//! let err = SpiceError::network("connection reset", Some(503))
//!     .with_context("endpoint", json!("https://api.example.com"))
//!     .with_context("attempt", json!(2));
//!
//! assert_eq!(err.code(), "NetworkError");
//! assert_eq!(err.status_code(), Some(503));
//! assert_eq!(err.context()["attempt"], json!(2));
//! ```

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Result type used throughout the engine
pub type SpiceResult<T> = std::result::Result<T, SpiceError>;

/// Context bag attached to every error
pub type ErrorContext = HashMap<String, Value>;

/// Retry guidance attached to [`SpiceError::Retryable`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryHint {
    /// Do not retry even though the kind is Retryable
    pub skip_retry: bool,

    /// Suggested delay before the next attempt
    pub delay_ms: Option<u64>,
}

/// Error taxonomy for all graph operations
#[derive(Error, Debug, Clone)]
pub enum SpiceError {
    /// Input or state validation failed
    #[error("Validation failed: {message}")]
    Validation { message: String, context: ErrorContext },

    /// Authentication or authorization failed
    #[error("Authentication failed: {message}")]
    Authentication { message: String, context: ErrorContext },

    /// Network-level failure, optionally with an HTTP status code
    #[error("Network error: {message}")]
    Network {
        message: String,
        status_code: Option<u16>,
        context: ErrorContext,
    },

    /// Operation exceeded its time limit
    #[error("Operation timed out: {message}")]
    Timeout {
        message: String,
        duration_ms: Option<u64>,
        context: ErrorContext,
    },

    /// Remote side signalled throttling
    #[error("Rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after_ms: Option<u64>,
        context: ErrorContext,
    },

    /// Serialization or deserialization failed
    #[error("Serialization error: {message}")]
    Serialization { message: String, context: ErrorContext },

    /// Engine, graph, or node configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration { message: String, context: ErrorContext },

    /// A tool execution failed
    #[error("Tool error: {message}")]
    Tool { message: String, context: ErrorContext },

    /// A tool could not be found by name
    #[error("Tool lookup failed: {message}")]
    ToolLookup { message: String, context: ErrorContext },

    /// No outgoing edge matched and the node is not terminal
    #[error("Routing error: {message}")]
    Routing { message: String, context: ErrorContext },

    /// An agent implementation failed
    #[error("Agent error: {message}")]
    Agent { message: String, context: ErrorContext },

    /// Node or graph execution failed; wraps the original cause
    #[error("Execution failed: {message}")]
    Execution {
        message: String,
        graph_id: Option<String>,
        node_id: Option<String>,
        #[source]
        cause: Option<Box<SpiceError>>,
        context: ErrorContext,
    },

    /// Checkpoint persistence failed
    #[error("Checkpoint error: {message}")]
    Checkpoint { message: String, context: ErrorContext },

    /// Explicitly retryable failure with optional guidance
    #[error("Retryable error: {message}")]
    Retryable {
        message: String,
        status_code: Option<u16>,
        hint: Option<RetryHint>,
        context: ErrorContext,
    },

    /// Unclassified failure
    #[error("Unknown error: {message}")]
    Unknown { message: String, context: ErrorContext },
}

impl SpiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn network(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::Network {
            message: message.into(),
            status_code,
            context: ErrorContext::new(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            duration_ms: None,
            context: ErrorContext::new(),
        }
    }

    pub fn timeout_after(message: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            message: message.into(),
            duration_ms: Some(duration_ms),
            context: ErrorContext::new(),
        }
    }

    pub fn rate_limit(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self::RateLimit {
            message: message.into(),
            retry_after_ms,
            context: ErrorContext::new(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::Tool {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn tool_lookup(message: impl Into<String>) -> Self {
        Self::ToolLookup {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self::Agent {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            graph_id: None,
            node_id: None,
            cause: None,
            context: ErrorContext::new(),
        }
    }

    /// Execution error pinned to a graph/node coordinate
    pub fn execution_at(
        message: impl Into<String>,
        graph_id: Option<String>,
        node_id: Option<String>,
    ) -> Self {
        Self::Execution {
            message: message.into(),
            graph_id,
            node_id,
            cause: None,
            context: ErrorContext::new(),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn retryable(
        message: impl Into<String>,
        status_code: Option<u16>,
        hint: Option<RetryHint>,
    ) -> Self {
        Self::Retryable {
            message: message.into(),
            status_code,
            hint,
            context: ErrorContext::new(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Stable error code for logging, metrics, and state history entries
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::Authentication { .. } => "AuthenticationError",
            Self::Network { .. } => "NetworkError",
            Self::Timeout { .. } => "TimeoutError",
            Self::RateLimit { .. } => "RateLimitError",
            Self::Serialization { .. } => "SerializationError",
            Self::Configuration { .. } => "ConfigurationError",
            Self::Tool { .. } => "ToolError",
            Self::ToolLookup { .. } => "ToolLookupError",
            Self::Routing { .. } => "RoutingError",
            Self::Agent { .. } => "AgentError",
            Self::Execution { .. } => "ExecutionError",
            Self::Checkpoint { .. } => "CheckpointError",
            Self::Retryable { .. } => "RetryableError",
            Self::Unknown { .. } => "UnknownError",
        }
    }

    /// The context bag
    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Validation { context, .. }
            | Self::Authentication { context, .. }
            | Self::Network { context, .. }
            | Self::Timeout { context, .. }
            | Self::RateLimit { context, .. }
            | Self::Serialization { context, .. }
            | Self::Configuration { context, .. }
            | Self::Tool { context, .. }
            | Self::ToolLookup { context, .. }
            | Self::Routing { context, .. }
            | Self::Agent { context, .. }
            | Self::Execution { context, .. }
            | Self::Checkpoint { context, .. }
            | Self::Retryable { context, .. }
            | Self::Unknown { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::Validation { context, .. }
            | Self::Authentication { context, .. }
            | Self::Network { context, .. }
            | Self::Timeout { context, .. }
            | Self::RateLimit { context, .. }
            | Self::Serialization { context, .. }
            | Self::Configuration { context, .. }
            | Self::Tool { context, .. }
            | Self::ToolLookup { context, .. }
            | Self::Routing { context, .. }
            | Self::Agent { context, .. }
            | Self::Execution { context, .. }
            | Self::Checkpoint { context, .. }
            | Self::Retryable { context, .. }
            | Self::Unknown { context, .. } => context,
        }
    }

    /// Copy with an additional context entry
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_mut().insert(key.into(), value);
        self
    }

    /// Attach a preserved cause; only `Execution` keeps a typed cause,
    /// other kinds record it in context
    pub fn with_cause(mut self, cause: SpiceError) -> Self {
        if let Self::Execution { cause: slot, .. } = &mut self {
            *slot = Some(Box::new(cause));
            return self;
        }
        let rendered = Value::String(cause.to_string());
        self.with_context("cause", rendered)
    }

    /// The preserved cause, when this is an `Execution` wrapper
    pub fn cause(&self) -> Option<&SpiceError> {
        match self {
            Self::Execution { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// HTTP-ish status code, from a typed field or the context bag
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Network { status_code, .. } | Self::Retryable { status_code, .. } => {
                *status_code
            }
            _ => self
                .context()
                .get("statusCode")
                .and_then(|v| v.as_u64())
                .map(|v| v as u16),
        }
    }

    /// Hinted retry delay (rate limits and retryable hints)
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimit { retry_after_ms, .. } => *retry_after_ms,
            Self::Retryable { hint, .. } => hint.as_ref().and_then(|h| h.delay_ms),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SpiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<spice_checkpoint::CheckpointError> for SpiceError {
    fn from(err: spice_checkpoint::CheckpointError) -> Self {
        Self::checkpoint(err.to_string())
    }
}
