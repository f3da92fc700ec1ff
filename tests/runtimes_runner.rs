use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use stategraph::event_bus::EventBus;
use stategraph::graphs::{GraphBuilder, Route, Router};
use stategraph::node::{Node, NodeContext, NodeError, PartialUpdate};
use stategraph::reliability::RetryPolicy;
use stategraph::runtimes::{
    Checkpointer, CheckpointerKind, InMemoryCheckpointer, PausedReason, Runner, RunnerError,
    StepOptions, StepResult, ThreadInit,
};
use stategraph::state::Snapshot;
use stategraph::types::NodeId;

mod common;
use common::*;

fn named(name: &str) -> NodeId {
    NodeId::named(name)
}

/// Runner wired to a checkpointer handle the test keeps, so stored
/// timelines can be inspected directly.
fn runner_with_shared_checkpointer(
    plan: stategraph::plan::Plan,
) -> (Runner, Arc<dyn Checkpointer>) {
    let checkpointer: Arc<dyn Checkpointer> = Arc::new(InMemoryCheckpointer::new());
    let runner = Runner::with_checkpointer(
        Arc::new(plan),
        Some(Arc::clone(&checkpointer)),
        true,
        EventBus::default(),
        true,
    );
    (runner, checkpointer)
}

#[tokio::test]
async fn linear_pipeline_concatenates_messages() {
    let plan = builder_with_channels()
        .add_node("a", MessageNode::new("A ran"))
        .add_node("b", MessageNode::new("B ran"))
        .set_entry("a")
        .add_edge("a", "b")
        .add_edge("b", "End")
        .compile()
        .unwrap();

    let final_snapshot = plan.invoke(store_with_messages()).await.unwrap();

    assert_messages(&final_snapshot, &["A ran", "B ran"]);
    // Seeded at 1, bumped once per superstep that changed the channel.
    assert_eq!(final_snapshot.version("messages"), 3);
}

#[tokio::test]
async fn each_superstep_advances_the_step_counter() {
    let plan = linear_plan();
    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
    runner
        .create_thread("t".into(), store_with_messages())
        .await
        .unwrap();

    let first = runner.run_step("t", StepOptions::default()).await.unwrap();
    let StepResult::Completed(report) = first else {
        panic!("expected completed step");
    };
    assert_eq!(report.step, 1);
    assert_eq!(report.ran_nodes, vec![named("a")]);
    assert_eq!(report.next_frontier, vec![named("b")]);
    assert!(!report.completed);

    let second = runner.run_step("t", StepOptions::default()).await.unwrap();
    let StepResult::Completed(report) = second else {
        panic!("expected completed step");
    };
    assert_eq!(report.step, 2);
    assert!(report.completed);
    assert_eq!(runner.is_thread_complete("t"), Some(true));

    let snapshot = runner.get_thread("t").unwrap().store.snapshot();
    assert_messages(&snapshot, &["ran:a:step:1", "ran:b:step:2"]);
}

#[tokio::test]
async fn stepping_a_complete_thread_is_a_noop() {
    let plan = linear_plan();
    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
    runner
        .create_thread("t".into(), store_with_messages())
        .await
        .unwrap();
    runner.run_until_complete("t").await.unwrap();

    let result = runner.run_step("t", StepOptions::default()).await.unwrap();
    let StepResult::Completed(report) = result else {
        panic!("expected completed report");
    };
    assert!(report.completed);
    assert!(report.ran_nodes.is_empty());
    assert_eq!(report.step, 2, "step counter must not advance");
}

#[tokio::test]
async fn router_picks_branch_by_parity() {
    fn parity_plan() -> stategraph::plan::Plan {
        let router: Router = Arc::new(|snapshot: &Snapshot| {
            if snapshot.get_i64("number").unwrap_or(0) % 2 == 0 {
                Route::Single("even_handler".into())
            } else {
                Route::Single("odd_handler".into())
            }
        });
        builder_with_channels()
            .add_node("classify", NoopNode)
            .add_node("even_handler", MessageNode::new("even"))
            .add_node("odd_handler", MessageNode::new("odd"))
            .set_entry("classify")
            .add_conditional_edge("classify", router, ["even_handler", "odd_handler"])
            .add_edge("even_handler", "End")
            .add_edge("odd_handler", "End")
            .compile()
            .unwrap()
    }

    let even = parity_plan()
        .invoke(store_with("number", json!(4)))
        .await
        .unwrap();
    assert_messages(&even, &["even"]);

    let odd = parity_plan()
        .invoke(store_with("number", json!(7)))
        .await
        .unwrap();
    assert_messages(&odd, &["odd"]);
}

#[tokio::test]
async fn multi_route_activates_several_targets() {
    let router: Router = Arc::new(|_: &Snapshot| {
        Route::Multi(vec!["left".into(), "right".into(), "left".into()])
    });
    let plan = builder_with_channels()
        .add_node("fork", NoopNode)
        .add_node("left", TraceNode { name: "left" })
        .add_node("right", TraceNode { name: "right" })
        .set_entry("fork")
        .add_conditional_edge("fork", router, ["left", "right"])
        .add_edge("left", "End")
        .add_edge("right", "End")
        .compile()
        .unwrap();

    let final_snapshot = plan.invoke(store_with_messages()).await.unwrap();
    // The duplicate "left" decision collapses; both targets run once, in
    // decision order, in the same superstep.
    assert_messages(&final_snapshot, &["ran:left:step:2", "ran:right:step:2"]);
}

#[tokio::test]
async fn terminal_route_finishes_the_branch() {
    let router: Router = Arc::new(|_: &Snapshot| Route::Terminal);
    let plan = builder_with_channels()
        .add_node("only", TraceNode { name: "only" })
        .set_entry("only")
        .add_conditional_edge("only", router, ["only", "End"])
        .compile()
        .unwrap();

    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
    runner
        .create_thread("t".into(), store_with_messages())
        .await
        .unwrap();
    let result = runner.run_step("t", StepOptions::default()).await.unwrap();
    let StepResult::Completed(report) = result else {
        panic!("expected completed step");
    };
    assert!(report.next_frontier.is_empty());
    assert!(report.completed);
}

#[tokio::test]
async fn router_target_outside_allow_list_fails_the_run() {
    // Static edge keeps "b" reachable so the plan compiles; the router's
    // decision is what violates the allow-list at runtime.
    let router: Router = Arc::new(|_: &Snapshot| Route::Single("b".into()));
    let plan = builder_with_channels()
        .add_node("a", NoopNode)
        .add_node("b", NoopNode)
        .set_entry("a")
        .add_edge("a", "b")
        .add_edge("b", "End")
        .add_conditional_edge("a", router, ["End"])
        .compile()
        .unwrap();

    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
    runner
        .create_thread("t".into(), store_with_messages())
        .await
        .unwrap();
    let err = runner
        .run_step("t", StepOptions::default())
        .await
        .unwrap_err();
    match err {
        RunnerError::Routing(stategraph::graphs::RoutingError::TargetNotAllowed {
            from,
            target,
        }) => {
            assert_eq!(from, named("a"));
            assert_eq!(target, "b");
        }
        other => panic!("expected routing error, got {other:?}"),
    }
}

#[tokio::test]
async fn transient_failure_recovers_on_second_attempt() {
    let plan = builder_with_channels()
        .add_node("flaky", FlakyNode::new(1))
        .set_entry("flaky")
        .add_edge("flaky", "End")
        .with_retry_policy(
            "flaky",
            RetryPolicy::new(3).with_base_delay(std::time::Duration::from_millis(1)),
        )
        .compile()
        .unwrap();

    let final_snapshot = plan.invoke(store_with_messages()).await.unwrap();
    assert_messages(&final_snapshot, &["recovered after 2 calls"]);
    // A recovered node is a success: nothing lands in the errors channel.
    assert!(error_records(&final_snapshot).is_empty());
}

#[tokio::test]
async fn fan_out_runs_against_one_snapshot_and_merges_at_the_barrier() {
    struct JoinProbe;

    #[async_trait]
    impl Node for JoinProbe {
        async fn run(
            &self,
            snapshot: Snapshot,
            _ctx: NodeContext,
        ) -> Result<PartialUpdate, NodeError> {
            let seen = snapshot.get_array("messages").map_or(0, Vec::len);
            Ok(PartialUpdate::single(
                "messages",
                json!([format!("d saw {seen} entries")]),
            ))
        }
    }

    struct SnapshotProbe {
        label: &'static str,
    }

    #[async_trait]
    impl Node for SnapshotProbe {
        async fn run(
            &self,
            snapshot: Snapshot,
            _ctx: NodeContext,
        ) -> Result<PartialUpdate, NodeError> {
            // Peers of the same superstep must be invisible here.
            let seen = snapshot.get_array("messages").map_or(0, Vec::len);
            Ok(PartialUpdate::single(
                "messages",
                json!([format!("{} saw {seen}", self.label)]),
            ))
        }
    }

    let plan = builder_with_channels()
        .add_node("b", SnapshotProbe { label: "b" })
        .add_node("c", SnapshotProbe { label: "c" })
        .add_node("d", JoinProbe)
        .set_entry("b")
        .add_edge("Start", "c")
        .add_edge("b", "d")
        .add_edge("c", "d")
        .add_edge("d", "End")
        .compile()
        .unwrap();

    let final_snapshot = plan.invoke(store_with_messages()).await.unwrap();
    // b and c both saw the empty pre-step snapshot; d ran once despite two
    // incoming edges and saw both merged contributions.
    assert_messages(&final_snapshot, &["b saw 0", "c saw 0", "d saw 2 entries"]);
}

#[tokio::test]
async fn interrupt_before_pauses_without_running_the_node() {
    let plan = linear_plan();
    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
    runner
        .create_thread("t".into(), store_with_messages())
        .await
        .unwrap();

    let options = StepOptions {
        interrupt_before: vec![named("a")],
        ..StepOptions::default()
    };
    let result = runner.run_step("t", options).await.unwrap();
    let StepResult::Paused(paused) = result else {
        panic!("expected pause");
    };
    assert_eq!(paused.reason, PausedReason::BeforeNode(named("a")));
    assert_eq!(paused.thread_state.step, 0);
    assert_messages(&paused.thread_state.store.snapshot(), &[]);

    // Dropping the interrupt resumes from exactly where it paused.
    let result = runner.run_step("t", StepOptions::default()).await.unwrap();
    let StepResult::Completed(report) = result else {
        panic!("expected completed step");
    };
    assert_eq!(report.step, 1);
    assert_eq!(report.ran_nodes, vec![named("a")]);
}

#[tokio::test]
async fn interrupt_after_pauses_with_state_already_merged() {
    let plan = linear_plan();
    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
    runner
        .create_thread("t".into(), store_with_messages())
        .await
        .unwrap();

    let options = StepOptions {
        interrupt_after: vec![named("a")],
        ..StepOptions::default()
    };
    let result = runner.run_step("t", options).await.unwrap();
    let StepResult::Paused(paused) = result else {
        panic!("expected pause");
    };
    assert_eq!(paused.reason, PausedReason::AfterNode(named("a")));
    assert_eq!(paused.thread_state.step, 1);
    assert_messages(&paused.thread_state.store.snapshot(), &["ran:a:step:1"]);
}

#[tokio::test]
async fn interrupt_each_step_walks_one_superstep_at_a_time() {
    let plan = linear_plan();
    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
    runner
        .create_thread("t".into(), store_with_messages())
        .await
        .unwrap();

    let options = StepOptions {
        interrupt_each_step: true,
        ..StepOptions::default()
    };

    let mut pauses = Vec::new();
    loop {
        match runner.run_step("t", options.clone()).await.unwrap() {
            StepResult::Paused(paused) => pauses.push(paused.reason),
            StepResult::Completed(report) => {
                assert!(report.completed);
                break;
            }
        }
    }
    assert_eq!(
        pauses,
        vec![PausedReason::AfterStep(1), PausedReason::AfterStep(2)]
    );
}

#[tokio::test]
async fn failed_node_routes_to_its_error_handler() {
    let plan = builder_with_channels()
        .add_node("ingest", FailingNode::new("upstream went away"))
        .add_node("cleanup", MessageNode::new("cleanup ran"))
        .set_entry("ingest")
        .add_edge("ingest", "End")
        .add_error_edge("ingest", "cleanup")
        .add_edge("cleanup", "End")
        .compile()
        .unwrap();

    let final_snapshot = plan.invoke(store_with_messages()).await.unwrap();

    assert_messages(&final_snapshot, &["cleanup ran"]);
    assert_error_from(&final_snapshot, "ingest");
    let record = &error_records(&final_snapshot)[0];
    assert_eq!(record["step"], json!(1));
    assert_eq!(record["attempts"], json!(1));
    assert!(record["message"]
        .as_str()
        .unwrap()
        .contains("upstream went away"));
}

#[tokio::test]
async fn error_handler_replaces_ordinary_successors() {
    // With an error edge in play, the failed node's static successor must
    // not activate.
    let plan = builder_with_channels()
        .add_node("ingest", FailingNode::new("boom"))
        .add_node("next", MessageNode::new("next ran"))
        .add_node("cleanup", MessageNode::new("cleanup ran"))
        .set_entry("ingest")
        .add_edge("ingest", "next")
        .add_edge("next", "End")
        .add_error_edge("ingest", "cleanup")
        .add_edge("cleanup", "End")
        .compile()
        .unwrap();

    let final_snapshot = plan.invoke(store_with_messages()).await.unwrap();
    assert_messages(&final_snapshot, &["cleanup ran"]);
}

#[tokio::test]
async fn uncovered_failure_discards_the_whole_superstep() {
    let plan = builder_with_channels()
        .add_node("good", MessageNode::new("good"))
        .add_node("bad", FlakyNode::new(1))
        .set_entry("good")
        .add_edge("Start", "bad")
        .add_edge("good", "End")
        .add_edge("bad", "End")
        .compile()
        .unwrap();

    let (mut runner, checkpointer) = runner_with_shared_checkpointer(plan);
    runner
        .create_thread("t".into(), store_with_messages())
        .await
        .unwrap();

    let err = runner
        .run_step("t", StepOptions::default())
        .await
        .unwrap_err();
    match err {
        RunnerError::NodeFailed {
            node,
            step,
            attempts,
            ..
        } => {
            assert_eq!(node, named("bad"));
            assert_eq!(step, 1);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected NodeFailed, got {other:?}"),
    }

    // The peer's output was discarded with the rest of the superstep and
    // the thread still sits before step 1.
    let thread = runner.get_thread("t").unwrap();
    assert_eq!(thread.step, 0);
    let snapshot = thread.store.snapshot();
    assert_messages(&snapshot, &[]);
    assert_error_from(&snapshot, "bad");

    // Stored history still ends at the seed; the failure was not persisted.
    assert_eq!(checkpointer.list_steps("t").await.unwrap(), vec![0]);

    // Retrying replays the same superstep; this time the flaky node's
    // second call succeeds and both outputs merge.
    let result = runner.run_step("t", StepOptions::default()).await.unwrap();
    let StepResult::Completed(report) = result else {
        panic!("expected completed step");
    };
    assert_eq!(report.step, 1);

    let thread = runner.get_thread("t").unwrap();
    assert_messages(
        &thread.store.snapshot(),
        &["good", "recovered after 2 calls"],
    );
    assert_eq!(checkpointer.list_steps("t").await.unwrap(), vec![0, 1]);
}

#[tokio::test]
async fn run_until_complete_surfaces_node_failure() {
    let plan = builder_with_channels()
        .add_node("bad", FailingNode::new("permanently broken"))
        .set_entry("bad")
        .add_edge("bad", "End")
        .compile()
        .unwrap();

    let err = plan.invoke(store_with_messages()).await.unwrap_err();
    assert!(matches!(err, RunnerError::NodeFailed { node, .. } if node == named("bad")));
}

fn counter_loop_plan(stop_at: i64) -> stategraph::plan::Plan {
    let router: Router = Arc::new(move |snapshot: &Snapshot| {
        if snapshot.get_i64("count").unwrap_or(0) < stop_at {
            Route::Single("increment".into())
        } else {
            Route::end()
        }
    });
    builder_with_channels()
        .add_node("increment", CounterNode)
        .set_entry("increment")
        .add_conditional_edge("increment", router, ["increment", "End"])
        .compile()
        .unwrap()
}

#[tokio::test]
async fn cycles_run_until_the_router_exits() {
    let plan = counter_loop_plan(5);
    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
    runner
        .create_thread("t".into(), store_with("count", json!(0)))
        .await
        .unwrap();
    let final_snapshot = runner.run_until_complete("t").await.unwrap();

    assert_eq!(final_snapshot.get_i64("count"), Some(5));
    assert_eq!(runner.get_thread("t").unwrap().step, 5);
}

#[tokio::test]
async fn resume_thread_at_rewinds_and_replays() {
    let plan = counter_loop_plan(3);
    let (mut runner, checkpointer) = runner_with_shared_checkpointer(plan);
    runner
        .create_thread("t".into(), store_with("count", json!(0)))
        .await
        .unwrap();
    runner.run_until_complete("t").await.unwrap();
    assert_eq!(
        checkpointer.list_steps("t").await.unwrap(),
        vec![0, 1, 2, 3]
    );

    let init = runner.resume_thread_at("t", 1).await.unwrap();
    assert_eq!(init, ThreadInit::Resumed { checkpoint_step: 1 });
    let thread = runner.get_thread("t").unwrap();
    assert_eq!(thread.step, 1);
    assert_eq!(thread.store.get("count"), Some(&json!(1)));
    assert_eq!(runner.is_thread_complete("t"), Some(false));

    let final_snapshot = runner.run_until_complete("t").await.unwrap();
    assert_eq!(final_snapshot.get_i64("count"), Some(3));
    // The replayed branch rewrote steps 2..3 in place of the old ones.
    assert_eq!(
        checkpointer.list_steps("t").await.unwrap(),
        vec![0, 1, 2, 3]
    );
}

#[tokio::test]
async fn resume_thread_at_unknown_step_is_an_error() {
    let plan = counter_loop_plan(2);
    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
    runner
        .create_thread("t".into(), store_with("count", json!(0)))
        .await
        .unwrap();

    let err = runner.resume_thread_at("t", 42).await.unwrap_err();
    assert!(matches!(
        err,
        RunnerError::CheckpointNotFound { step: 42, .. }
    ));
}

#[tokio::test]
async fn create_thread_resumes_from_the_latest_checkpoint() {
    let plan = counter_loop_plan(3);
    let checkpointer: Arc<dyn Checkpointer> = Arc::new(InMemoryCheckpointer::new());

    let plan = Arc::new(plan);
    let mut first = Runner::with_checkpointer(
        Arc::clone(&plan),
        Some(Arc::clone(&checkpointer)),
        true,
        EventBus::default(),
        true,
    );
    first
        .create_thread("t".into(), store_with("count", json!(0)))
        .await
        .unwrap();
    first.run_until_complete("t").await.unwrap();
    drop(first);

    let mut second = Runner::with_checkpointer(
        plan,
        Some(checkpointer),
        true,
        EventBus::default(),
        true,
    );
    // The seed store here is ignored in favor of stored state.
    let init = second
        .create_thread("t".into(), store_with("count", json!(99)))
        .await
        .unwrap();
    assert_eq!(init, ThreadInit::Resumed { checkpoint_step: 3 });
    assert_eq!(
        second.get_thread("t").unwrap().store.get("count"),
        Some(&json!(3))
    );
    assert_eq!(second.is_thread_complete("t"), Some(true));
}

#[tokio::test]
async fn unknown_thread_is_reported() {
    let plan = linear_plan();
    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
    let err = runner
        .run_step("ghost", StepOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::ThreadNotFound { thread_id } if thread_id == "ghost"));
}

#[tokio::test]
async fn event_stream_can_only_be_taken_once() {
    let plan = linear_plan();
    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;

    let stream = runner.event_stream().expect("first take should succeed");
    drop(stream);
    assert!(runner.event_stream().is_none());
}

#[tokio::test]
async fn list_threads_is_sorted() {
    let plan = linear_plan();
    let mut runner = Runner::new(plan, CheckpointerKind::InMemory).await;
    for id in ["zeta", "alpha", "mid"] {
        runner
            .create_thread(id.into(), store_with_messages())
            .await
            .unwrap();
    }
    assert_eq!(runner.list_threads(), vec!["alpha", "mid", "zeta"]);
}
