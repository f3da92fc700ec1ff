//! Edge and routing types for graph construction.
//!
//! Static edges are plain `from → to` pairs. Conditional edges pair a
//! [`Router`] closure with an allow-list of permitted targets; the router
//! inspects the post-merge snapshot and returns a [`Route`] decision that
//! the runner checks against the allow-list before following it.

use std::fmt;
use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

use crate::state::Snapshot;
use crate::types::NodeId;

/// Routing decision returned by a [`Router`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Activate one target node next superstep.
    Single(String),
    /// Activate several target nodes concurrently next superstep.
    Multi(Vec<String>),
    /// Finish this branch; activate nothing.
    Terminal,
}

impl Route {
    /// Route to the virtual terminal node.
    #[must_use]
    pub fn end() -> Self {
        Route::Single(NodeId::End.to_string())
    }

    /// Target names this decision activates, in decision order.
    #[must_use]
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Route::Single(target) => vec![target.as_str()],
            Route::Multi(targets) => targets.iter().map(String::as_str).collect(),
            Route::Terminal => Vec::new(),
        }
    }
}

impl From<&str> for Route {
    fn from(target: &str) -> Self {
        Route::Single(target.to_string())
    }
}

impl From<String> for Route {
    fn from(target: String) -> Self {
        Route::Single(target)
    }
}

/// Routing function evaluated against the post-merge snapshot.
pub type Router = Arc<dyn Fn(&Snapshot) -> Route + Send + Sync>;

/// Conditional edge: a router plus the targets it may legally pick.
///
/// The allow-list is declared at build time so the compiler can validate
/// every potential target against the node set; a router returning a target
/// outside the list is a runtime [`RoutingError`].
#[derive(Clone)]
pub struct ConditionalEdge {
    from: NodeId,
    router: Router,
    allow: Vec<NodeId>,
}

impl ConditionalEdge {
    /// Build a conditional edge out of `from` with the given allow-list.
    #[must_use]
    pub fn new(from: NodeId, router: Router, allow: Vec<NodeId>) -> Self {
        Self {
            from,
            router,
            allow,
        }
    }

    /// Source node of this edge.
    #[must_use]
    pub fn from(&self) -> &NodeId {
        &self.from
    }

    /// Routing function.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Permitted targets, in declaration order.
    #[must_use]
    pub fn allow(&self) -> &[NodeId] {
        &self.allow
    }

    /// Whether the allow-list permits the given target.
    #[must_use]
    pub fn allows(&self, target: &NodeId) -> bool {
        self.allow.contains(target)
    }
}

impl fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("from", &self.from)
            .field("router", &"<fn>")
            .field("allow", &self.allow)
            .finish()
    }
}

/// Runtime routing failures.
#[derive(Debug, Error, Diagnostic)]
pub enum RoutingError {
    /// Router picked a target outside its declared allow-list.
    #[error("router on '{from}' returned '{target}', which is not in its allow-list")]
    #[diagnostic(
        code(stategraph::routing::target_not_allowed),
        help("add '{target}' to the allow-list of the conditional edge from '{from}', or fix the router")
    )]
    TargetNotAllowed {
        /// Node the edge leaves.
        from: NodeId,
        /// The disallowed target the router returned.
        target: String,
    },
}
