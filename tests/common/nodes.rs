//! Fixture nodes used across integration tests.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::json;
use stategraph::node::{Node, NodeContext, NodeError, PartialUpdate};
use stategraph::state::Snapshot;

/// Appends a fixed message to the `messages` channel.
#[allow(dead_code)]
pub struct MessageNode {
    pub msg: &'static str,
}

#[allow(dead_code)]
impl MessageNode {
    pub fn new(msg: &'static str) -> Self {
        Self { msg }
    }
}

#[async_trait]
impl Node for MessageNode {
    async fn run(&self, _snapshot: Snapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        Ok(PartialUpdate::single("messages", json!([self.msg])))
    }
}

/// Appends `ran:{name}:step:{step}` to the `messages` channel, so tests can
/// assert both which node ran and in which superstep.
#[allow(dead_code)]
pub struct TraceNode {
    pub name: &'static str,
}

#[async_trait]
impl Node for TraceNode {
    async fn run(&self, _snapshot: Snapshot, ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        Ok(PartialUpdate::single(
            "messages",
            json!([format!("ran:{}:step:{}", self.name, ctx.step)]),
        ))
    }
}

/// Produces an empty update. Useful for shape-only routing tests.
#[allow(dead_code)]
pub struct NoopNode;

#[async_trait]
impl Node for NoopNode {
    async fn run(&self, _snapshot: Snapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        Ok(PartialUpdate::new())
    }
}

/// Sleeps before contributing, for barrier-timing tests.
#[allow(dead_code)]
pub struct DelayedNode {
    pub name: &'static str,
    pub delay_ms: u64,
}

#[async_trait]
impl Node for DelayedNode {
    async fn run(&self, _snapshot: Snapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        Ok(PartialUpdate::single("messages", json!([self.name])))
    }
}

/// Always fails with the given message.
#[allow(dead_code)]
#[derive(Default)]
pub struct FailingNode {
    pub error_message: &'static str,
}

#[allow(dead_code)]
impl FailingNode {
    pub fn new(error_message: &'static str) -> Self {
        Self { error_message }
    }
}

#[async_trait]
impl Node for FailingNode {
    async fn run(&self, _snapshot: Snapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        Err(NodeError::Invalid(self.error_message.to_string()))
    }
}

/// Fails the first `fail_times` invocations, then succeeds with a message
/// recording how many calls it took.
#[allow(dead_code)]
pub struct FlakyNode {
    pub fail_times: u32,
    pub calls: AtomicU32,
}

#[allow(dead_code)]
impl FlakyNode {
    pub fn new(fail_times: u32) -> Self {
        Self {
            fail_times,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Node for FlakyNode {
    async fn run(&self, _snapshot: Snapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_times {
            Err(NodeError::External {
                service: "fixture",
                message: format!("transient failure {call}"),
            })
        } else {
            Ok(PartialUpdate::single(
                "messages",
                json!([format!("recovered after {call} calls")]),
            ))
        }
    }
}

/// Increments the `count` channel by one.
#[allow(dead_code)]
pub struct CounterNode;

#[async_trait]
impl Node for CounterNode {
    async fn run(&self, snapshot: Snapshot, _ctx: NodeContext) -> Result<PartialUpdate, NodeError> {
        let count = snapshot.get_i64("count").unwrap_or(0);
        Ok(PartialUpdate::single("count", json!(count + 1)))
    }
}
