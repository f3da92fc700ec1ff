//! Nested plan execution through [`SubgraphNode`]: parents scheduling a
//! child plan like any node, shared checkpoint stores, failure surfacing,
//! and resumption of nested runs across a replayed superstep.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use stategraph::event_bus::EventBus;
use stategraph::graphs::GraphBuilder;
use stategraph::node::{Node, NodeContext, NodeError, PartialUpdate};
use stategraph::plan::Plan;
use stategraph::reducers::{Append, Overwrite};
use stategraph::runtimes::{Checkpointer, InMemoryCheckpointer, Runner, RunnerError};
use stategraph::state::Snapshot;
use stategraph::subgraph::SubgraphNode;
use stategraph::types::NodeId;

use common::*;

/// Seeds the question the child plan answers.
struct PrepareNode;

#[async_trait]
impl Node for PrepareNode {
    async fn run(&self, _snapshot: Snapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        Ok(PartialUpdate::new()
            .set("question", json!("life"))
            .set("messages", json!(["prepared"])))
    }
}

/// Child worker answering whatever question was projected in, counting how
/// often it actually runs.
struct SolveNode {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Node for SolveNode {
    async fn run(&self, snapshot: Snapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let question = snapshot.get_str("question").unwrap_or("nothing");
        Ok(PartialUpdate::single(
            "answer",
            json!([format!("answer to {question}")]),
        ))
    }
}

/// Folds the child's answers into the parent transcript.
struct SummarizeNode;

#[async_trait]
impl Node for SummarizeNode {
    async fn run(&self, snapshot: Snapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        let answers = snapshot.get_array("answer").map(Vec::len).unwrap_or(0);
        Ok(PartialUpdate::single(
            "messages",
            json!([format!("summarized {answers} answer(s)")]),
        ))
    }
}

/// Leaf of the doubly nested pipeline.
struct LeafNode;

#[async_trait]
impl Node for LeafNode {
    async fn run(&self, _snapshot: Snapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        Ok(PartialUpdate::single("trail", json!(["leaf"])))
    }
}

fn child_plan(calls: Arc<AtomicU32>) -> Plan {
    GraphBuilder::new()
        .add_node("solve", SolveNode { calls })
        .add_channel("answer", Arc::new(Append))
        .set_entry("solve")
        .add_edge("solve", "End")
        .compile()
        .expect("child plan compiles")
}

#[tokio::test]
async fn parent_schedules_child_plan_like_any_node() {
    let calls = Arc::new(AtomicU32::new(0));
    let nested = SubgraphNode::new(child_plan(Arc::clone(&calls)))
        .with_input_channels(["question"])
        .with_output_channels(["answer"]);

    let parent = GraphBuilder::new()
        .add_channel("messages", Arc::new(Append))
        .add_channel("question", Arc::new(Overwrite))
        .add_channel("answer", Arc::new(Overwrite))
        .add_node("prepare", PrepareNode)
        .add_node("research", nested)
        .add_node("summarize", SummarizeNode)
        .set_entry("prepare")
        .add_edge("prepare", "research")
        .add_edge("research", "summarize")
        .add_edge("summarize", "End")
        .compile()
        .unwrap();

    let snapshot = parent.invoke(store_with_messages()).await.unwrap();

    assert_eq!(snapshot.get("answer"), Some(&json!(["answer to life"])));
    assert_messages(&snapshot, &["prepared", "summarized 1 answer(s)"]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn nested_timelines_live_in_the_shared_checkpoint_store() {
    let shared: Arc<dyn Checkpointer> = Arc::new(InMemoryCheckpointer::new());
    let calls = Arc::new(AtomicU32::new(0));
    let nested = SubgraphNode::new(child_plan(calls)).with_checkpointer(Arc::clone(&shared));

    let parent = GraphBuilder::new()
        .add_channel("messages", Arc::new(Append))
        .add_channel("question", Arc::new(Overwrite))
        .add_channel("answer", Arc::new(Overwrite))
        .add_node("prepare", PrepareNode)
        .add_node("research", nested)
        .set_entry("prepare")
        .add_edge("prepare", "research")
        .add_edge("research", "End")
        .compile()
        .unwrap();

    let mut runner = Runner::with_checkpointer(
        Arc::new(parent),
        Some(Arc::clone(&shared)),
        true,
        EventBus::default(),
        true,
    );
    runner
        .create_thread("assist-1".into(), store_with_messages())
        .await
        .unwrap();
    runner.run_until_complete("assist-1").await.unwrap();

    // The child ran at parent superstep 2, so its thread id encodes that.
    let threads = shared.list_threads().await.unwrap();
    assert_eq!(threads, ["assist-1", "assist-1::research#2"]);

    let child_steps = shared.list_steps("assist-1::research#2").await.unwrap();
    assert_eq!(child_steps, [0, 1]);

    let child_latest = shared
        .get_latest("assist-1::research#2")
        .await
        .unwrap()
        .expect("child checkpoint exists");
    assert_eq!(
        child_latest.store.snapshot().get("answer"),
        Some(&json!(["answer to life"]))
    );
}

#[tokio::test]
async fn child_failure_surfaces_as_subgraph_error() {
    let child = GraphBuilder::new()
        .add_node("explode", FailingNode::new("inner exploded"))
        .set_entry("explode")
        .add_edge("explode", "End")
        .compile()
        .unwrap();

    let parent = GraphBuilder::new()
        .add_channel("messages", Arc::new(Append))
        .add_node("research", SubgraphNode::new(child))
        .set_entry("research")
        .add_edge("research", "End")
        .compile()
        .unwrap();

    let err = parent.invoke(store_with_messages()).await.unwrap_err();
    match err {
        RunnerError::NodeFailed {
            node,
            source: NodeError::Subgraph(message),
            ..
        } => {
            assert_eq!(node, NodeId::named("research"));
            assert!(message.contains("inner exploded"));
        }
        other => panic!("expected subgraph failure, got {other:?}"),
    }
}

#[tokio::test]
async fn replayed_superstep_resumes_the_nested_run() {
    let shared: Arc<dyn Checkpointer> = Arc::new(InMemoryCheckpointer::new());
    let calls = Arc::new(AtomicU32::new(0));
    let nested = SubgraphNode::new(child_plan(Arc::clone(&calls)))
        .with_checkpointer(Arc::clone(&shared))
        .with_output_channels(["answer"]);

    let parent = GraphBuilder::new()
        .add_channel("messages", Arc::new(Append))
        .add_channel("answer", Arc::new(Overwrite))
        .add_node("research", nested)
        .add_node("flaky", FlakyNode::new(1))
        .add_edge("Start", "research")
        .add_edge("Start", "flaky")
        .add_edge("research", "End")
        .add_edge("flaky", "End")
        .compile()
        .unwrap();

    let mut runner = Runner::with_checkpointer(
        Arc::new(parent),
        Some(Arc::clone(&shared)),
        true,
        EventBus::default(),
        true,
    );
    runner
        .create_thread("retry-1".into(), store_with_messages())
        .await
        .unwrap();

    let err = runner.run_until_complete("retry-1").await.unwrap_err();
    assert!(matches!(err, RunnerError::NodeFailed { ref node, .. } if *node == NodeId::named("flaky")));

    let snapshot = runner.run_until_complete("retry-1").await.unwrap();
    assert_eq!(snapshot.get("answer"), Some(&json!(["answer to nothing"])));
    assert!(messages_of(&snapshot).contains(&"recovered after 2 calls".to_string()));

    // One nested run total: the replayed superstep descended into the
    // finished child instead of starting another.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let threads = shared.list_threads().await.unwrap();
    assert_eq!(threads, ["retry-1", "retry-1::research#1"]);
}

#[tokio::test]
async fn subgraphs_nest_recursively() {
    let grandchild = GraphBuilder::new()
        .add_node("leaf", LeafNode)
        .add_channel("trail", Arc::new(Append))
        .set_entry("leaf")
        .add_edge("leaf", "End")
        .compile()
        .unwrap();

    let child = GraphBuilder::new()
        .add_node(
            "inner",
            SubgraphNode::new(grandchild).with_output_channels(["trail"]),
        )
        .add_channel("trail", Arc::new(Append))
        .set_entry("inner")
        .add_edge("inner", "End")
        .compile()
        .unwrap();

    let parent = GraphBuilder::new()
        .add_node(
            "outer",
            SubgraphNode::new(child).with_output_channels(["trail"]),
        )
        .add_channel("trail", Arc::new(Overwrite))
        .add_channel("messages", Arc::new(Append))
        .set_entry("outer")
        .add_edge("outer", "End")
        .compile()
        .unwrap();

    let snapshot = parent.invoke(store_with_messages()).await.unwrap();
    assert_eq!(snapshot.get("trail"), Some(&json!(["leaf"])));
}
