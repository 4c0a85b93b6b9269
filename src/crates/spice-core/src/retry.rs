//! Retry supervision - classified errors, exponential backoff, jitter
//!
//! Every node attempt runs through the [`RetrySupervisor`]. On failure the
//! supervisor classifies the error, consults the effective [`RetryPolicy`],
//! and either surfaces the error (not retryable), schedules another attempt
//! after a computed delay, or converts the failure into an exhaustion error
//! carrying the full attempt history.
//!
//! # Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Node attempt (op closure)                               │
//! └─────────────┬────────────────────────────────────────────┘
//!               │ Err(e)
//!               ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  ErrorClassifier                                         │
//! │  • RetryableError / Timeout / RateLimit  → retry         │
//! │  • Network 408/429/5xx or no status      → retry         │
//! │  • Validation / Auth / Config / ...      → surface       │
//! │  • Tool / Agent / Execution / Checkpoint → by context    │
//! └─────────────┬────────────────────────────────────────────┘
//!               │ retry allowed?
//!               ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  RetryPolicy                                             │
//! │  delay = initial × multiplier^(attempt-1), capped,       │
//! │  ± jitter_factor, clamped to [0, max_delay];             │
//! │  Retry-After hints win when the error carries one        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Attempt counting is **total attempts**: `max_attempts = 3` means one
//! initial call plus two retries; `max_attempts = 1` disables retries.
//!
//! # Presets
//!
//! | Preset | Attempts | Initial | Factor | Cap | Jitter |
//! |--------|----------|---------|--------|-----|--------|
//! | [`RetryPolicy::default`] | 3 | 200ms | 2.0 | 10s | 10% |
//! | [`RetryPolicy::no_retry`] | 1 | - | - | - | - |
//! | [`RetryPolicy::aggressive`] | 5 | 100ms | 1.5 | 5s | 10% |
//! | [`RetryPolicy::conservative`] | 3 | 1s | 3.0 | 30s | 10% |
//! | [`RetryPolicy::rate_limit_friendly`] | 5 | 1s | 2.0 | 60s | 20% |
//!
//! # Example
//!
//! ```rust
//! use spice_core::retry::RetryPolicy;
//!
//! let policy = RetryPolicy::default();
//! for attempt in 1..=policy.max_attempts {
//!     let delay = policy.calculate_delay(attempt);
//!     assert!(delay <= policy.max_delay);
//! }
//! assert!(policy.has_more_retries(1));
//! assert!(!policy.has_more_retries(3));
//! ```

use crate::error::{SpiceError, SpiceResult};
use crate::events::{EventBus, GraphEvent, GraphEventKind};
use crate::message::Message;
use rand::Rng;
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Backoff configuration for node attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 disables retries
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Multiplier applied per subsequent retry
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Symmetric jitter fraction in `[0, 1]`
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fast, shallow backoff for low-latency dependencies
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.1,
        }
    }

    /// Slow, steep backoff for fragile dependencies
    pub fn conservative() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 3.0,
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }

    /// Wide spacing and extra jitter for rate-limited APIs
    pub fn rate_limit_friendly() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.2,
        }
    }

    /// Whether another retry may follow the given (1-indexed) attempt
    pub fn has_more_retries(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the retry following the given (1-indexed) attempt
    ///
    /// Exponential backoff capped at `max_delay`, with symmetric jitter in
    /// `[-jitter_factor × delay, +jitter_factor × delay]`, clamped to
    /// `[0, max_delay]`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter_factor > 0.0 {
            let mut rng = rand::thread_rng();
            let offset = rng.gen_range(-self.jitter_factor..=self.jitter_factor);
            capped * (1.0 + offset)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.clamp(0.0, self.max_delay.as_secs_f64()))
    }
}

/// Retry decision for one error value
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub should_retry: bool,
    /// Hinted delay, e.g. from a Retry-After header
    pub retry_after_ms: Option<u64>,
}

impl Classification {
    fn retry() -> Self {
        Self {
            should_retry: true,
            retry_after_ms: None,
        }
    }

    fn surface() -> Self {
        Self {
            should_retry: false,
            retry_after_ms: None,
        }
    }
}

/// Pure error → retry-decision mapping
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify an error; a pure function of the error value
    pub fn classify(error: &SpiceError) -> Classification {
        match error {
            SpiceError::Retryable { hint, .. } => {
                if hint.as_ref().is_some_and(|h| h.skip_retry) {
                    Classification::surface()
                } else {
                    Classification {
                        should_retry: true,
                        retry_after_ms: hint.as_ref().and_then(|h| h.delay_ms),
                    }
                }
            }
            SpiceError::Network { status_code, .. } => match status_code {
                None => Classification::retry(),
                Some(408) | Some(429) => Classification::retry(),
                Some(code) if (500..=599).contains(code) => Classification::retry(),
                Some(_) => Classification::surface(),
            },
            SpiceError::Timeout { .. } => Classification::retry(),
            SpiceError::RateLimit { retry_after_ms, .. } => Classification {
                should_retry: true,
                retry_after_ms: *retry_after_ms,
            },
            SpiceError::Validation { .. }
            | SpiceError::Authentication { .. }
            | SpiceError::Serialization { .. }
            | SpiceError::Configuration { .. }
            | SpiceError::ToolLookup { .. }
            | SpiceError::Routing { .. } => Classification::surface(),
            SpiceError::Agent { .. }
            | SpiceError::Tool { .. }
            | SpiceError::Execution { .. }
            | SpiceError::Checkpoint { .. } => {
                let flagged = error
                    .context()
                    .get("retryable")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let status_retryable = matches!(
                    error.status_code(),
                    Some(408) | Some(429) | Some(500..=599)
                );
                if flagged || status_retryable {
                    Classification::retry()
                } else {
                    Classification::surface()
                }
            }
            SpiceError::Unknown { .. } => Classification::surface(),
        }
    }
}

/// One failed attempt, kept for the exhaustion report
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub code: &'static str,
    pub message: String,
    pub status_code: Option<u16>,
}

/// Mutable bookkeeping across the attempts of one node execution
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub node_id: String,
    pub tenant_id: Option<String>,
    /// 1-indexed; the attempt currently being (or about to be) made
    pub attempt_number: u32,
    pub errors: Vec<AttemptFailure>,
    pub total_retry_delay: Duration,
    pub started_at: Instant,
}

impl RetryContext {
    fn new(node_id: &str, tenant_id: Option<String>) -> Self {
        Self {
            node_id: node_id.to_string(),
            tenant_id,
            attempt_number: 1,
            errors: Vec::new(),
            total_retry_delay: Duration::ZERO,
            started_at: Instant::now(),
        }
    }

    fn record_failure(&mut self, error: &SpiceError) {
        self.errors.push(AttemptFailure {
            attempt: self.attempt_number,
            code: error.code(),
            message: error.to_string(),
            status_code: error.status_code(),
        });
    }

    fn history_json(&self) -> serde_json::Value {
        json!(self
            .errors
            .iter()
            .map(|f| {
                json!({
                    "attempt": f.attempt,
                    "code": f.code,
                    "message": f.message,
                    "statusCode": f.status_code,
                })
            })
            .collect::<Vec<_>>())
    }
}

/// Outcome of a supervised execution
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// The operation succeeded (possibly after retries)
    Success { value: T, context: RetryContext },
    /// Retries ran out; `error` is the `Execution` wrapper with history
    Exhausted {
        context: RetryContext,
        error: SpiceError,
    },
    /// Classification refused to retry; `error` is the original
    NotRetryable {
        context: RetryContext,
        error: SpiceError,
    },
}

/// Per-tenant / per-error policy override hook
pub trait RetryPolicyResolver: Send + Sync {
    /// Return a policy to use instead of the call-site policy, or `None`
    fn resolve(&self, error: &SpiceError, tenant_id: Option<&str>) -> Option<RetryPolicy>;
}

/// Observer of retry activity; must be safe for concurrent recording
pub trait RetryMetrics: Send + Sync {
    fn retry_attempt(&self, node_id: &str, delay_ms: u64);
    fn retry_success(&self, node_id: &str, total_attempts: u32);
    fn retry_exhausted(&self, node_id: &str);
    fn non_retryable(&self, node_id: &str);
}

/// Metrics sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRetryMetrics;

impl RetryMetrics for NoopRetryMetrics {
    fn retry_attempt(&self, _node_id: &str, _delay_ms: u64) {}
    fn retry_success(&self, _node_id: &str, _total_attempts: u32) {}
    fn retry_exhausted(&self, _node_id: &str) {}
    fn non_retryable(&self, _node_id: &str) {}
}

/// Atomic counters, usable from concurrent runs
#[derive(Debug, Default)]
pub struct InMemoryRetryMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    exhausted: AtomicU64,
    non_retryable: AtomicU64,
}

impl InMemoryRetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    pub fn non_retryable(&self) -> u64 {
        self.non_retryable.load(Ordering::Relaxed)
    }
}

impl RetryMetrics for InMemoryRetryMetrics {
    fn retry_attempt(&self, node_id: &str, delay_ms: u64) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(node_id, delay_ms, "retry scheduled");
    }

    fn retry_success(&self, node_id: &str, total_attempts: u32) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(node_id, total_attempts, "retry succeeded");
    }

    fn retry_exhausted(&self, node_id: &str) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(node_id, "retries exhausted");
    }

    fn non_retryable(&self, node_id: &str) {
        self.non_retryable.fetch_add(1, Ordering::Relaxed);
    }
}

/// Wraps node attempts with classification, backoff, and bookkeeping
#[derive(Clone)]
pub struct RetrySupervisor {
    metrics: Arc<dyn RetryMetrics>,
    resolver: Option<Arc<dyn RetryPolicyResolver>>,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl Default for RetrySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetrySupervisor {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(NoopRetryMetrics),
            resolver: None,
            event_bus: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn RetryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_policy_resolver(mut self, resolver: Arc<dyn RetryPolicyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Publish `ToolCallRetrying` events to this bus on scheduled retries
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Run `op` under the policy until success, exhaustion, or a
    /// non-retryable failure
    ///
    /// `op` receives a fresh copy of the message and the 1-indexed attempt
    /// number, so side effects happen at most once per attempt.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        message: &Message,
        node_id: &str,
        policy: &RetryPolicy,
        op: F,
    ) -> RetryOutcome<T>
    where
        F: Fn(Message, u32) -> Fut,
        Fut: Future<Output = SpiceResult<T>> + Send,
    {
        let tenant_id = message.metadata_str("tenantId").map(str::to_string);
        let mut context = RetryContext::new(node_id, tenant_id);

        loop {
            match op(message.clone(), context.attempt_number).await {
                Ok(value) => {
                    if context.attempt_number > 1 {
                        self.metrics
                            .retry_success(node_id, context.attempt_number);
                    }
                    return RetryOutcome::Success { value, context };
                }
                Err(error) => {
                    let effective = self
                        .resolver
                        .as_ref()
                        .and_then(|r| r.resolve(&error, context.tenant_id.as_deref()))
                        .unwrap_or_else(|| policy.clone());

                    let classification = ErrorClassifier::classify(&error);
                    if !classification.should_retry {
                        self.metrics.non_retryable(node_id);
                        context.record_failure(&error);
                        return RetryOutcome::NotRetryable { context, error };
                    }

                    if !effective.has_more_retries(context.attempt_number) {
                        self.metrics.retry_exhausted(node_id);
                        context.record_failure(&error);
                        let wrapped = Self::exhaustion_error(&context, error);
                        return RetryOutcome::Exhausted {
                            context,
                            error: wrapped,
                        };
                    }

                    let delay = match classification.retry_after_ms {
                        Some(hinted_ms) => {
                            Duration::from_millis(hinted_ms).min(effective.max_delay)
                        }
                        None => effective.calculate_delay(context.attempt_number),
                    };

                    self.metrics.retry_attempt(node_id, delay.as_millis() as u64);
                    if let Some(bus) = &self.event_bus {
                        bus.publish(
                            GraphEvent::new(GraphEventKind::ToolCallRetrying {
                                attempt: context.attempt_number,
                            })
                            .for_message(message)
                            .at_node(node_id)
                            .with_metadata("delayMs", json!(delay.as_millis() as u64))
                            .with_metadata("errorCode", json!(error.code())),
                        );
                    }
                    tracing::debug!(
                        node_id,
                        attempt = context.attempt_number,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after failure"
                    );

                    context.record_failure(&error);
                    context.total_retry_delay += delay;
                    context.attempt_number += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn exhaustion_error(context: &RetryContext, original: SpiceError) -> SpiceError {
        let last_status = original.status_code();
        let last_code = original.code();
        let last_message = original.to_string();

        let mut error = SpiceError::execution(format!(
            "retries exhausted for node '{}' after {} attempts",
            context.node_id, context.attempt_number
        ))
        .with_context("retriesExhausted", json!(true))
        .with_context("totalAttempts", json!(context.attempt_number))
        .with_context(
            "totalRetryDelayMs",
            json!(context.total_retry_delay.as_millis() as u64),
        )
        .with_context(
            "elapsedMs",
            json!(context.started_at.elapsed().as_millis() as u64),
        )
        .with_context("lastError", json!(last_message))
        .with_context("lastErrorCode", json!(last_code))
        .with_context("originalErrorCode", json!(last_code))
        .with_context("errorHistory", context.history_json());

        if let Some(status) = last_status {
            error = error.with_context("lastStatusCode", json!(status));
        }
        error.with_cause(original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetryHint;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_presets() {
        let default = RetryPolicy::default();
        assert_eq!(default.max_attempts, 3);
        assert_eq!(default.initial_delay, Duration::from_millis(200));

        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
        assert_eq!(RetryPolicy::aggressive().max_attempts, 5);
        assert_eq!(
            RetryPolicy::conservative().max_delay,
            Duration::from_secs(30)
        );
        assert_eq!(RetryPolicy::rate_limit_friendly().jitter_factor, 0.2);
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(100),
            jitter_factor: 0.0,
        };

        assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_capped_and_clamped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(50),
            jitter_factor: 0.2,
        };

        for attempt in 1..=10 {
            let delay = policy.calculate_delay(attempt);
            assert!(delay <= policy.max_delay, "attempt {}: {:?}", attempt, delay);
        }
    }

    #[test]
    fn test_attempt_counting() {
        let policy = RetryPolicy::default(); // 3 attempts
        assert!(policy.has_more_retries(1));
        assert!(policy.has_more_retries(2));
        assert!(!policy.has_more_retries(3));

        assert!(!RetryPolicy::no_retry().has_more_retries(1));
    }

    #[test]
    fn test_classification_table() {
        use ErrorClassifier as C;

        assert!(C::classify(&SpiceError::timeout("t")).should_retry);
        assert!(C::classify(&SpiceError::network("n", None)).should_retry);
        assert!(C::classify(&SpiceError::network("n", Some(503))).should_retry);
        assert!(C::classify(&SpiceError::network("n", Some(429))).should_retry);
        assert!(C::classify(&SpiceError::network("n", Some(408))).should_retry);
        assert!(!C::classify(&SpiceError::network("n", Some(404))).should_retry);

        assert!(!C::classify(&SpiceError::validation("v")).should_retry);
        assert!(!C::classify(&SpiceError::authentication("a")).should_retry);
        assert!(!C::classify(&SpiceError::serialization("s")).should_retry);
        assert!(!C::classify(&SpiceError::configuration("c")).should_retry);
        assert!(!C::classify(&SpiceError::tool_lookup("t")).should_retry);
        assert!(!C::classify(&SpiceError::routing("r")).should_retry);
        assert!(!C::classify(&SpiceError::unknown("u")).should_retry);

        let rate_limited = C::classify(&SpiceError::rate_limit("r", Some(1200)));
        assert!(rate_limited.should_retry);
        assert_eq!(rate_limited.retry_after_ms, Some(1200));

        let skip = SpiceError::retryable(
            "r",
            None,
            Some(RetryHint {
                skip_retry: true,
                delay_ms: None,
            }),
        );
        assert!(!C::classify(&skip).should_retry);

        // Conditional kinds retry only with a flag or retryable status
        assert!(!C::classify(&SpiceError::tool("t")).should_retry);
        let flagged = SpiceError::tool("t").with_context("retryable", json!(true));
        assert!(C::classify(&flagged).should_retry);
        let status = SpiceError::agent("a").with_context("statusCode", json!(502));
        assert!(C::classify(&status).should_retry);
    }

    #[test]
    fn test_classification_is_stable() {
        let err = SpiceError::network("n", Some(503));
        let first = ErrorClassifier::classify(&err);
        for _ in 0..10 {
            assert_eq!(ErrorClassifier::classify(&err), first);
        }
    }

    fn fail_n_then_ok(failures: u32) -> impl Fn(Message, u32) -> futures::future::BoxFuture<'static, SpiceResult<String>> {
        let remaining = Arc::new(AtomicU32::new(failures));
        move |_msg, _attempt| {
            let remaining = remaining.clone();
            Box::pin(async move {
                if remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    n.checked_sub(1)
                })
                .is_ok()
                {
                    Err(SpiceError::network("boom", Some(503)))
                } else {
                    Ok("ok".to_string())
                }
            })
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let metrics = Arc::new(InMemoryRetryMetrics::new());
        let supervisor = RetrySupervisor::new().with_metrics(metrics.clone());
        let message = Message::new("x");

        let outcome = supervisor
            .execute_with_retry(&message, "tool", &fast_policy(3), fail_n_then_ok(2))
            .await;

        match outcome {
            RetryOutcome::Success { value, context } => {
                assert_eq!(value, "ok");
                assert_eq!(context.attempt_number, 3);
                assert_eq!(context.errors.len(), 2);
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(metrics.attempts(), 2);
        assert_eq!(metrics.successes(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let metrics = Arc::new(InMemoryRetryMetrics::new());
        let supervisor = RetrySupervisor::new().with_metrics(metrics.clone());
        let message = Message::new("x");

        let outcome = supervisor
            .execute_with_retry(&message, "tool", &fast_policy(3), fail_n_then_ok(4))
            .await;

        match outcome {
            RetryOutcome::Exhausted { context, error } => {
                assert_eq!(context.attempt_number, 3);
                assert_eq!(error.code(), "ExecutionError");
                assert_eq!(error.context()["retriesExhausted"], json!(true));
                assert_eq!(error.context()["totalAttempts"], json!(3));
                assert_eq!(error.context()["originalErrorCode"], json!("NetworkError"));
                assert_eq!(error.context()["lastStatusCode"], json!(503));
                assert_eq!(
                    error.context()["errorHistory"].as_array().unwrap().len(),
                    3
                );
                assert_eq!(error.cause().unwrap().code(), "NetworkError");
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(metrics.exhausted(), 1);
        assert_eq!(metrics.attempts(), 2);
    }

    #[tokio::test]
    async fn test_not_retryable_surfaces_original() {
        let metrics = Arc::new(InMemoryRetryMetrics::new());
        let supervisor = RetrySupervisor::new().with_metrics(metrics.clone());
        let message = Message::new("x");

        let outcome = supervisor
            .execute_with_retry(&message, "n", &fast_policy(3), |_msg, _attempt| {
                Box::pin(async { Err::<String, _>(SpiceError::validation("bad input")) })
            })
            .await;

        match outcome {
            RetryOutcome::NotRetryable { context, error } => {
                assert_eq!(context.attempt_number, 1);
                assert_eq!(error.code(), "ValidationError");
            }
            other => panic!("expected not-retryable, got {:?}", other),
        }
        assert_eq!(metrics.non_retryable(), 1);
        assert_eq!(metrics.attempts(), 0);
    }

    #[tokio::test]
    async fn test_total_delay_accounting() {
        let supervisor = RetrySupervisor::new();
        let message = Message::new("x");
        let policy = fast_policy(3);

        let outcome = supervisor
            .execute_with_retry(&message, "n", &policy, fail_n_then_ok(4))
            .await;

        if let RetryOutcome::Exhausted { context, error } = outcome {
            // Two scheduled retries: 1ms + 2ms with no jitter.
            assert_eq!(context.total_retry_delay, Duration::from_millis(3));
            assert_eq!(error.context()["totalRetryDelayMs"], json!(3));
        } else {
            panic!("expected exhaustion");
        }
    }

    #[tokio::test]
    async fn test_rate_limit_hint_capped_by_policy() {
        let supervisor = RetrySupervisor::new();
        let message = Message::new("x");
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_millis(10),
            jitter_factor: 0.0,
        };

        let start = Instant::now();
        let outcome = supervisor
            .execute_with_retry(&message, "n", &policy, |_msg, attempt| {
                Box::pin(async move {
                    if attempt == 1 {
                        // Hints at 60s; the policy caps it at 10ms.
                        Err(SpiceError::rate_limit("slow down", Some(60_000)))
                    } else {
                        Ok::<_, SpiceError>("done")
                    }
                })
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Success { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_policy_resolver_override() {
        struct NeverRetryTenant;

        impl RetryPolicyResolver for NeverRetryTenant {
            fn resolve(&self, _error: &SpiceError, tenant_id: Option<&str>) -> Option<RetryPolicy> {
                (tenant_id == Some("strict")).then(RetryPolicy::no_retry)
            }
        }

        let supervisor =
            RetrySupervisor::new().with_policy_resolver(Arc::new(NeverRetryTenant));
        let message = Message::new("x").with_metadata("tenantId", json!("strict"));

        let outcome = supervisor
            .execute_with_retry(&message, "n", &fast_policy(5), fail_n_then_ok(1))
            .await;

        // The override allows a single attempt only.
        assert!(matches!(outcome, RetryOutcome::Exhausted { .. }));
    }
}
