//! Benchmarks for superstep execution and barrier merging.
//!
//! The runner is built without a checkpointer and without a bus listener so
//! the numbers isolate scheduler fan-out, the barrier fold, and routing.

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

use stategraph::event_bus::EventBus;
use stategraph::graphs::GraphBuilder;
use stategraph::node::{Node, NodeContext, NodeError, PartialUpdate};
use stategraph::plan::Plan;
use stategraph::reducers::Append;
use stategraph::runtimes::{Runner, StepOptions};
use stategraph::state::{ChannelStore, Snapshot};
use stategraph::types::NodeId;

const FANOUT_WIDTHS: &[usize] = &[4, 16, 64];
const CHAIN_DEPTHS: &[usize] = &[8, 32, 128];
const WRITER_COUNTS: &[usize] = &[8, 64, 256];

/// Appends one fixed element to `messages`.
struct AppendNode {
    label: String,
}

#[async_trait::async_trait]
impl Node for AppendNode {
    async fn run(&self, _: Snapshot, _: NodeContext) -> Result<PartialUpdate, NodeError> {
        Ok(PartialUpdate::single("messages", json!([self.label.clone()])))
    }
}

fn seed_store() -> ChannelStore {
    ChannelStore::builder().with("messages", json!([])).build()
}

/// One superstep wide: Start -> [width workers] -> End
fn fanout_plan(width: usize) -> Arc<Plan> {
    let mut builder = GraphBuilder::new().add_channel("messages", Arc::new(Append));
    for i in 0..width {
        builder = builder
            .add_node(
                format!("worker_{i}"),
                AppendNode {
                    label: format!("m{i}"),
                },
            )
            .add_edge("Start", format!("worker_{i}"))
            .add_edge(format!("worker_{i}"), "End");
    }
    Arc::new(builder.compile().expect("plan"))
}

/// One node per superstep: Start -> step_0 -> ... -> End
fn chain_plan(depth: usize) -> Arc<Plan> {
    let mut builder = GraphBuilder::new().add_channel("messages", Arc::new(Append));
    for i in 0..depth {
        builder = builder.add_node(
            format!("step_{i}"),
            AppendNode {
                label: format!("m{i}"),
            },
        );
    }
    builder = builder.set_entry("step_0");
    for i in 0..depth - 1 {
        builder = builder.add_edge(format!("step_{i}"), format!("step_{}", i + 1));
    }
    builder = builder.add_edge(format!("step_{}", depth - 1), "End");
    Arc::new(builder.compile().expect("plan"))
}

/// Runner with no persistence and a bus nobody listens to.
fn quiet_runner(plan: Arc<Plan>) -> Runner {
    Runner::with_checkpointer(plan, None, false, EventBus::with_capacity(64), false)
}

fn bench_superstep_fanout(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("superstep_fanout");

    for &width in FANOUT_WIDTHS {
        let plan = fanout_plan(width);
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.to_async(&runtime).iter(|| {
                let plan = plan.clone();
                async move {
                    let mut runner = quiet_runner(plan);
                    runner
                        .create_thread("bench".into(), seed_store())
                        .await
                        .expect("thread");
                    runner
                        .run_step("bench", StepOptions::default())
                        .await
                        .expect("step")
                }
            });
        });
    }

    group.finish();
}

fn bench_chain_run(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("chain_run");

    for &depth in CHAIN_DEPTHS {
        let plan = chain_plan(depth);
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.to_async(&runtime).iter(|| {
                let plan = plan.clone();
                async move {
                    let mut runner = quiet_runner(plan);
                    runner
                        .create_thread("bench".into(), seed_store())
                        .await
                        .expect("thread");
                    runner.run_until_complete("bench").await.expect("run")
                }
            });
        });
    }

    group.finish();
}

fn bench_barrier_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("barrier_merge");
    let plan = fanout_plan(1);

    for &writers in WRITER_COUNTS {
        let outputs: Vec<(NodeId, PartialUpdate)> = (0..writers)
            .map(|i| {
                (
                    NodeId::named(format!("worker_{i}")),
                    PartialUpdate::single("messages", json!([format!("m{i}")])),
                )
            })
            .collect();

        group.throughput(Throughput::Elements(writers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(writers),
            &outputs,
            |b, outputs| {
                b.iter_batched(
                    seed_store,
                    |mut store| plan.apply_barrier(&mut store, outputs).expect("merge"),
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_superstep_fanout,
    bench_chain_run,
    bench_barrier_merge,
);

criterion_main!(benches);
