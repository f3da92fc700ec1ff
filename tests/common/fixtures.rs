//! Store and plan fixtures shared across integration tests.

use std::sync::Arc;

use serde_json::{json, Value};
use stategraph::graphs::GraphBuilder;
use stategraph::reducers::{Append, Overwrite};
use stategraph::state::ChannelStore;

use super::nodes::TraceNode;

/// Store seeded with an empty `messages` array.
#[allow(dead_code)]
pub fn store_with_messages() -> ChannelStore {
    ChannelStore::builder().with("messages", json!([])).build()
}

/// Store seeded with a single extra channel on top of `messages`.
#[allow(dead_code)]
pub fn store_with(key: &str, value: Value) -> ChannelStore {
    ChannelStore::builder()
        .with("messages", json!([]))
        .with(key, value)
        .build()
}

/// Builder pre-loaded with the channels the fixture nodes write.
#[allow(dead_code)]
pub fn builder_with_channels() -> GraphBuilder {
    GraphBuilder::new()
        .add_channel("messages", Arc::new(Append))
        .add_channel("count", Arc::new(Overwrite))
        .add_channel("number", Arc::new(Overwrite))
}

/// Two-node linear pipeline: Start -> a -> b -> End, tracing each run.
#[allow(dead_code)]
pub fn linear_plan() -> stategraph::plan::Plan {
    builder_with_channels()
        .add_node("a", TraceNode { name: "a" })
        .add_node("b", TraceNode { name: "b" })
        .set_entry("a")
        .add_edge("a", "b")
        .add_edge("b", "End")
        .compile()
        .unwrap()
}
