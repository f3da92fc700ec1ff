//! Reducers: per-channel merge semantics for barrier folds.
//!
//! Every channel is bound to exactly one reducer at graph-definition time.
//! At the end of a superstep the barrier collects each channel's ordered
//! contributions (registration order, which equals frontier order) and folds
//! them through the channel's reducer to produce the next committed value.
//!
//! Built-in reducers:
//!
//! - [`Overwrite`]: last write wins; divergent same-superstep writes are a
//!   fatal [`ConflictError`]
//! - [`Append`]: ordered concatenation into an array channel
//! - [`UnionMerge`]: shallow object merge, later keys win

mod append;
mod overwrite;
mod registry;
mod union_merge;

pub use append::Append;
pub use overwrite::Overwrite;
pub use registry::ReducerRegistry;
pub use union_merge::UnionMerge;

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::types::NodeId;

/// Reserved channel receiving structured [`ErrorEvent`](crate::node::ErrorEvent)
/// records. Always bound to the [`Append`] reducer.
pub const ERRORS_CHANNEL: &str = "errors";

/// One node's contribution to one channel within a superstep.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelWrite {
    /// Node that produced the contribution.
    pub writer: NodeId,
    /// The contributed value.
    pub value: Value,
}

/// Merge function bound to a channel.
///
/// `fold` receives the channel's committed value from the previous superstep
/// (`None` if never written) and every contribution of the current superstep
/// in deterministic order, and produces the value to commit.
pub trait Reducer: Send + Sync {
    fn fold(
        &self,
        channel: &str,
        current: Option<&Value>,
        writes: &[ChannelWrite],
    ) -> Result<Value, ChannelError>;
}

/// Two same-superstep writers disagreed on an [`Overwrite`] channel.
#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
#[error("conflicting writes to overwrite channel {channel:?}: {left_writer} wrote {left}, {right_writer} wrote {right}")]
#[diagnostic(
    code(stategraph::reducers::conflict),
    help("Bind the channel to the append or union-merge reducer if concurrent writers are intended.")
)]
pub struct ConflictError {
    /// Channel both nodes wrote to.
    pub channel: String,
    /// First writer, in registration order.
    pub left_writer: String,
    /// First writer's value.
    pub left: Value,
    /// The disagreeing writer.
    pub right_writer: String,
    /// The disagreeing value.
    pub right: Value,
}

/// Errors surfaced by a barrier fold. All of them fail the superstep; they
/// indicate authoring defects, not transient conditions, and are never
/// retried.
#[derive(Debug, Error, Diagnostic)]
pub enum ChannelError {
    /// Divergent same-superstep writes to an overwrite channel.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Conflict(#[from] ConflictError),

    /// A node wrote to a channel the graph never declared.
    #[error("undeclared channel {channel:?} written by node {writer}")]
    #[diagnostic(
        code(stategraph::reducers::undeclared),
        help("Declare the channel with a reducer on the graph builder before using it.")
    )]
    Undeclared { channel: String, writer: String },

    /// The channel's stored value or a contribution has the wrong shape for
    /// its reducer.
    #[error("channel {channel:?} expected {expected}, found {found}")]
    #[diagnostic(code(stategraph::reducers::type_mismatch))]
    TypeMismatch {
        channel: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Short JSON type name for diagnostics.
pub(crate) fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
