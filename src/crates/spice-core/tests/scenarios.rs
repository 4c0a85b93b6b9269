//! End-to-end scenarios: linear routing, retries, HITL pause/resume,
//! nested subgraphs, and checkpoint expiry.

use async_trait::async_trait;
use serde_json::{json, Value};
use spice_core::error::{SpiceError, SpiceResult};
use spice_core::events::InMemoryEventBus;
use spice_core::graph::Graph;
use spice_core::keys;
use spice_core::message::{Message, MessageState, ToolCall};
use spice_core::node::{
    Agent, AgentNode, DecisionNode, HumanNode, OutputNode, SelectionItem, SubgraphNode, Tool,
    ToolNode, ToolResult,
};
use spice_core::resume::{GraphRegistry, ResumeEngine, ResumeOptions};
use spice_core::retry::{InMemoryRetryMetrics, RetryPolicy, RetrySupervisor};
use spice_core::runner::GraphRunner;
use spice_checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Agent that prefixes the message content
struct Prefix(&'static str);

#[async_trait]
impl Agent for Prefix {
    fn name(&self) -> &str {
        "prefix"
    }

    async fn process_message(&self, message: Message) -> SpiceResult<Message> {
        let content = format!("{}: {}", self.0, message.content);
        Ok(message.with_content(content))
    }
}

/// Tool that fails `failures` times with NetworkError(status), then succeeds
struct Flaky {
    failures: AtomicU32,
    status: u16,
}

impl Flaky {
    fn new(failures: u32, status: u16) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            status,
        }
    }
}

#[async_trait]
impl Tool for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _params: HashMap<String, Value>) -> SpiceResult<ToolResult> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(SpiceError::network("upstream unavailable", Some(self.status)))
        } else {
            Ok(ToolResult::new(json!("ok")))
        }
    }
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: std::time::Duration::from_millis(200),
        backoff_multiplier: 2.0,
        max_delay: std::time::Duration::from_secs(10),
        jitter_factor: 0.0,
    }
}

// ---- S1: linear graph with decision ---------------------------------------

fn decision_graph() -> Graph {
    let route = DecisionNode::builder("route")
        .branch("type-a", "handler-a", |m| Ok(m.data_str("type") == Some("A")))
        .branch("type-b", "handler-b", |m| Ok(m.data_str("type") == Some("B")))
        .build()
        .unwrap();

    Graph::builder("s1")
        .add_node(route)
        .add_node(AgentNode::new("handler-a", Arc::new(Prefix("A"))))
        .add_node(AgentNode::new("handler-b", Arc::new(Prefix("B"))))
        .add_node(OutputNode::new("out-a"))
        .add_node(OutputNode::new("out-b"))
        .add_conditional_edge("route", "handler-a", |m| {
            m.data_str(keys::SELECTED_BRANCH) == Some("handler-a")
        })
        .add_conditional_edge("route", "handler-b", |m| {
            m.data_str(keys::SELECTED_BRANCH) == Some("handler-b")
        })
        .add_edge("handler-a", "out-a")
        .add_edge("handler-b", "out-b")
        .with_entry_point("route")
        .build()
        .unwrap()
}

#[tokio::test]
async fn s1_linear_graph_with_decision() {
    let graph = decision_graph();
    let input = Message::new("x").with_data("type", json!("A"));

    let result = GraphRunner::new().execute(&graph, input).await.unwrap();

    assert_eq!(result.state, MessageState::Completed);
    assert_eq!(result.content, "A: x");
    assert_eq!(result.data_str(keys::SELECTED_BRANCH), Some("handler-a"));
}

#[tokio::test]
async fn s1_decision_is_deterministic() {
    let graph = decision_graph();
    for _ in 0..3 {
        let result = GraphRunner::new()
            .execute(&graph, Message::new("x").with_data("type", json!("B")))
            .await
            .unwrap();
        assert_eq!(result.content, "B: x");
        assert_eq!(result.data_str(keys::SELECTED_BRANCH), Some("handler-b"));
    }
}

// ---- S2/S3: retry behavior ------------------------------------------------

#[tokio::test(start_paused = true)]
async fn s2_retry_then_success() {
    let metrics = Arc::new(InMemoryRetryMetrics::new());
    let runner = GraphRunner::new()
        .with_supervisor(RetrySupervisor::new().with_metrics(metrics.clone()));

    let graph = Graph::builder("s2")
        .add_node(ToolNode::new("call", Arc::new(Flaky::new(2, 503))))
        .add_edge("call", Graph::END)
        .with_entry_point("call")
        .with_retry_policy(fast_policy(3))
        .build()
        .unwrap();

    let result = runner.execute(&graph, Message::new("")).await.unwrap();

    assert_eq!(result.state, MessageState::Completed);
    assert_eq!(result.data_value("flaky_result"), Some(&json!("ok")));
    assert_eq!(metrics.attempts(), 2);
    assert_eq!(metrics.successes(), 1);
    assert_eq!(metrics.exhausted(), 0);
}

#[tokio::test(start_paused = true)]
async fn s3_retry_exhausted() {
    let metrics = Arc::new(InMemoryRetryMetrics::new());
    let runner = GraphRunner::new()
        .with_supervisor(RetrySupervisor::new().with_metrics(metrics.clone()));

    let graph = Graph::builder("s3")
        .add_node(ToolNode::new("call", Arc::new(Flaky::new(4, 500))))
        .add_edge("call", Graph::END)
        .with_entry_point("call")
        .with_retry_policy(fast_policy(3))
        .build()
        .unwrap();

    let error = runner.execute(&graph, Message::new("")).await.unwrap_err();

    assert_eq!(error.code(), "ExecutionError");
    assert_eq!(error.context()["retriesExhausted"], json!(true));
    assert_eq!(error.context()["totalAttempts"], json!(3));
    assert_eq!(error.context()["originalErrorCode"], json!("NetworkError"));
    assert_eq!(metrics.exhausted(), 1);
}

// ---- S4: HITL pause and resume with selection -----------------------------

fn confirm_child() -> Arc<Graph> {
    let hitl = HumanNode::selection(
        "hitlSelection",
        "Proceed with the plan?",
        vec![
            SelectionItem::new("confirm_yes", "Yes").with_description("Go ahead"),
            SelectionItem::new("confirm_no", "No"),
        ],
    );

    let decide = DecisionNode::builder("decide")
        .branch("yes", "yes-handler", |m| {
            Ok(m.data_str(keys::SELECTED_OPTION) == Some("confirm_yes"))
        })
        .otherwise("no-handler")
        .build()
        .unwrap();

    Arc::new(
        Graph::builder("confirm-child")
            .add_node(hitl)
            .add_node(decide)
            .add_node(AgentNode::new("yes-handler", Arc::new(Prefix("YES"))))
            .add_node(AgentNode::new("no-handler", Arc::new(Prefix("NO"))))
            .add_node(OutputNode::new("confirm-out"))
            .add_edge("hitlSelection", "decide")
            .add_conditional_edge("decide", "yes-handler", |m| {
                m.data_str(keys::SELECTED_BRANCH) == Some("yes-handler")
            })
            .add_conditional_edge("decide", "no-handler", |m| {
                m.data_str(keys::SELECTED_BRANCH) == Some("no-handler")
            })
            .add_edge("yes-handler", "confirm-out")
            .add_edge("no-handler", "confirm-out")
            .with_entry_point("hitlSelection")
            .build()
            .unwrap(),
    )
}

fn confirm_parent() -> Arc<Graph> {
    Arc::new(
        Graph::builder("confirm-parent")
            .add_node(SubgraphNode::new("confirm", confirm_child()))
            .add_node(OutputNode::new("done"))
            .add_edge("confirm", "done")
            .with_entry_point("confirm")
            .build()
            .unwrap(),
    )
}

fn user_selection(option: &str) -> Message {
    Message::new("").with_tool_call(ToolCall::new(
        keys::USER_RESPONSE,
        json!({"structured_data": {"selected_option": option}}),
    ))
}

#[tokio::test]
async fn s4_hitl_pause_and_resume_with_selection() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let parent = confirm_parent();
    let engine = ResumeEngine::new(store.clone())
        .with_registry(GraphRegistry::new().register(parent.clone()));

    let paused = engine
        .execute(&parent, Message::new("launch sequence"))
        .await
        .unwrap();
    assert_eq!(paused.state, MessageState::Waiting);

    let run_id = paused.run_id.clone().unwrap();
    let checkpoint = store.latest_for_run(&run_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.subgraph_stack.len(), 1);
    let pending = checkpoint.pending_tool_call.as_ref().unwrap();
    assert_eq!(pending["name"], json!(keys::REQUEST_USER_SELECTION));

    let result = engine
        .resume_run(&run_id, Some(user_selection("confirm_yes")), &ResumeOptions::default())
        .await
        .unwrap();

    assert_eq!(result.state, MessageState::Completed);
    assert!(result.content.starts_with("YES"), "content: {}", result.content);
    assert_eq!(result.data_str(keys::SELECTED_BRANCH), Some("yes-handler"));
    // auto_cleanup removed the run's checkpoints.
    assert!(store.list_by_run(&run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn s4_no_branch_taken_on_rejection() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let parent = confirm_parent();
    let engine = ResumeEngine::new(store.clone())
        .with_registry(GraphRegistry::new().register(parent.clone()));

    let paused = engine.execute(&parent, Message::new("x")).await.unwrap();
    let run_id = paused.run_id.clone().unwrap();

    let result = engine
        .resume_run(&run_id, Some(user_selection("confirm_no")), &ResumeOptions::default())
        .await
        .unwrap();

    assert!(result.content.starts_with("NO"));
    assert_eq!(result.data_str(keys::SELECTED_BRANCH), Some("no-handler"));
}

// ---- S5: nested subgraph HITL ---------------------------------------------

fn nested_parent() -> Arc<Graph> {
    let level2 = Arc::new(
        Graph::builder("level2")
            .add_node(HumanNode::input("deep-ask", "Speak, friend", "text"))
            .add_node(AgentNode::new("deep-handler", Arc::new(Prefix("DEEP"))))
            .add_node(OutputNode::new("level2-out"))
            .add_edge("deep-ask", "deep-handler")
            .add_edge("deep-handler", "level2-out")
            .with_entry_point("deep-ask")
            .build()
            .unwrap(),
    );

    let level1 = Arc::new(
        Graph::builder("level1")
            .add_node(SubgraphNode::new("level2-node", level2))
            .add_node(OutputNode::new("level1-out"))
            .add_edge("level2-node", "level1-out")
            .with_entry_point("level2-node")
            .build()
            .unwrap(),
    );

    Arc::new(
        Graph::builder("nested-parent")
            .add_node(SubgraphNode::new("level1-node", level1))
            .add_node(OutputNode::new("parent-out"))
            .add_edge("level1-node", "parent-out")
            .with_entry_point("level1-node")
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn s5_nested_subgraph_hitl() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let parent = nested_parent();
    let engine = ResumeEngine::new(store.clone())
        .with_registry(GraphRegistry::new().register(parent.clone()));

    let paused = engine.execute(&parent, Message::new("x")).await.unwrap();
    assert_eq!(paused.state, MessageState::Waiting);

    let run_id = paused.run_id.clone().unwrap();
    let checkpoint = store.latest_for_run(&run_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.subgraph_stack.len(), 2);

    // Outermost context first.
    let outer = &checkpoint.subgraph_stack[0];
    assert_eq!(outer.parent_graph_id, "nested-parent");
    assert_eq!(outer.parent_node_id, "level1-node");
    assert_eq!(outer.child_graph_id, "level1");
    let inner = &checkpoint.subgraph_stack[1];
    assert_eq!(inner.parent_graph_id, "level1");
    assert_eq!(inner.child_graph_id, "level2");
    assert_eq!(inner.child_node_id, "deep-ask");

    let user = Message::new("").with_tool_call(ToolCall::new(
        keys::USER_RESPONSE,
        json!({"text": "mellon"}),
    ));
    let result = engine
        .resume_run(&run_id, Some(user), &ResumeOptions::default())
        .await
        .unwrap();

    assert_eq!(result.state, MessageState::Completed);
    assert!(result.content.starts_with("DEEP"));
    assert_eq!(result.data_str(keys::RESPONSE_TEXT), Some("mellon"));
    // The stack has been fully unwound.
    let leftover_stack = result
        .metadata_value(keys::SUBGRAPH_STACK)
        .and_then(|v| v.as_array())
        .map(|stack| stack.len())
        .unwrap_or(0);
    assert_eq!(leftover_stack, 0);
}

#[tokio::test]
async fn subgraph_depth_limit_enforced() {
    let child = Arc::new(
        Graph::builder("child")
            .add_node(OutputNode::new("out"))
            .with_entry_point("out")
            .build()
            .unwrap(),
    );
    let parent = Graph::builder("parent")
        .add_node(SubgraphNode::new("sub", child).with_max_depth(0))
        .add_edge("sub", Graph::END)
        .with_entry_point("sub")
        .with_retry_policy(RetryPolicy::no_retry())
        .build()
        .unwrap();

    let error = GraphRunner::new()
        .execute(&parent, Message::new("x"))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("depth limit"));
}

// ---- S6: expired checkpoint refused ---------------------------------------

#[tokio::test]
async fn s6_expired_checkpoint_refused() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let parent = confirm_parent();
    let engine = ResumeEngine::new(store.clone())
        .with_registry(GraphRegistry::new().register(parent.clone()));

    let waiting = Message::new("x")
        .with_run_id("run-expired")
        .with_graph_id("confirm-parent")
        .with_node_id("confirm")
        .transition_to(MessageState::Running, "started")
        .transition_to(MessageState::Waiting, "paused");
    let checkpoint = Checkpoint::new(
        "run-expired",
        "confirm-parent",
        "confirm",
        serde_json::to_value(&waiting).unwrap(),
    )
    .with_expires_at(chrono::Utc::now() - chrono::Duration::minutes(5));
    store.save(&checkpoint).await.unwrap();

    let error = engine
        .resume_run("run-expired", None, &ResumeOptions::default())
        .await
        .unwrap_err();

    assert_eq!(error.code(), "ValidationError");
    assert!(error.to_string().contains("expired"));
    assert!(error.context().contains_key("checkpointAgeMs"));
    // The checkpoint survives a refused resume.
    assert_eq!(store.list_by_run("run-expired").await.unwrap().len(), 1);
}

#[tokio::test]
async fn resume_missing_run_fails() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = ResumeEngine::new(store);

    let error = engine
        .resume_run("ghost", None, &ResumeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.code(), "ExecutionError");
    assert!(error.to_string().contains("no checkpoint found"));
}

#[tokio::test]
async fn max_checkpoint_age_enforced_independently() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let parent = confirm_parent();
    let engine = ResumeEngine::new(store.clone())
        .with_registry(GraphRegistry::new().register(parent.clone()));

    // Unexpired checkpoint, but older than the caller's ceiling.
    let waiting = Message::new("x")
        .with_run_id("run-old")
        .with_graph_id("confirm-parent")
        .with_node_id("confirm")
        .transition_to(MessageState::Running, "started")
        .transition_to(MessageState::Waiting, "paused");
    let mut checkpoint = Checkpoint::new(
        "run-old",
        "confirm-parent",
        "confirm",
        serde_json::to_value(&waiting).unwrap(),
    );
    checkpoint.timestamp = chrono::Utc::now() - chrono::Duration::hours(2);
    store.save(&checkpoint).await.unwrap();

    let options = ResumeOptions::default().with_max_checkpoint_age(chrono::Duration::hours(1));
    let error = engine.resume_run("run-old", None, &options).await.unwrap_err();
    assert_eq!(error.code(), "ValidationError");
    assert_eq!(
        error.context()["maxCheckpointAgeMs"],
        json!(chrono::Duration::hours(1).num_milliseconds())
    );
}

// ---- Event stream ----------------------------------------------------------

#[tokio::test]
async fn tool_call_completed_published_on_resume() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let parent = confirm_parent();
    let engine = ResumeEngine::new(store.clone())
        .with_registry(GraphRegistry::new().register(parent.clone()))
        .with_event_bus(bus.clone());

    let paused = engine.execute(&parent, Message::new("x")).await.unwrap();
    let run_id = paused.run_id.clone().unwrap();

    engine
        .resume_run(&run_id, Some(user_selection("confirm_yes")), &ResumeOptions::default())
        .await
        .unwrap();

    assert_eq!(bus.events_named("WorkflowResumed").len(), 1);
    assert_eq!(bus.events_named("ToolCallReceived").len(), 1);
    assert_eq!(bus.events_named("ToolCallCompleted").len(), 1);

    // The response tool-call was written back for audit before cleanup;
    // the checkpoint itself is gone after terminal auto-cleanup.
    assert!(store.list_by_run(&run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn fail_on_error_false_returns_failed_message() {
    struct Boom;

    #[async_trait]
    impl Agent for Boom {
        fn name(&self) -> &str {
            "boom"
        }

        async fn process_message(&self, _message: Message) -> SpiceResult<Message> {
            Err(SpiceError::validation("nope"))
        }
    }

    let child = Arc::new(
        Graph::builder("fail-child")
            .add_node(HumanNode::input("ask", "q", "text"))
            .add_node(AgentNode::new("boom", Arc::new(Boom)))
            .add_node(OutputNode::new("out"))
            .add_edge("ask", "boom")
            .add_edge("boom", "out")
            .with_entry_point("ask")
            .build()
            .unwrap(),
    );
    let parent = Arc::new(
        Graph::builder("fail-parent")
            .add_node(SubgraphNode::new("sub", child))
            .add_node(OutputNode::new("done"))
            .add_edge("sub", "done")
            .with_entry_point("sub")
            .build()
            .unwrap(),
    );

    let store = Arc::new(InMemoryCheckpointStore::new());
    let engine = ResumeEngine::new(store.clone())
        .with_registry(GraphRegistry::new().register(parent.clone()));

    let paused = engine.execute(&parent, Message::new("x")).await.unwrap();
    let run_id = paused.run_id.clone().unwrap();

    let user = Message::new("").with_tool_call(ToolCall::new(
        keys::USER_RESPONSE,
        json!({"text": "anything"}),
    ));

    let options = ResumeOptions::default().with_fail_on_error(false);
    let result = engine.resume_run(&run_id, Some(user), &options).await.unwrap();

    assert_eq!(result.state, MessageState::Failed);
    // A failed resume does not auto-delete the checkpoint.
    assert_eq!(store.list_by_run(&run_id).await.unwrap().len(), 1);
}
