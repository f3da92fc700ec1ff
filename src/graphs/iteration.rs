//! Graph iteration utilities.
//!
//! Idiomatic iterators for inspecting a graph under construction or a
//! compiled [`Plan`], plus a deterministic ordering helper for display
//! and debugging.
//!
//! # Iterators
//!
//! - [`NodesIter`]: iterate over all registered nodes
//! - [`EdgesIter`]: iterate over all static edges as (source, target) pairs
//!
//! # Examples
//!
//! ```
//! use stategraph::graphs::GraphBuilder;
//!
//! # struct MyNode;
//! # #[async_trait::async_trait]
//! # impl stategraph::node::Node for MyNode {
//! #     async fn run(&self, _: stategraph::state::Snapshot, _: stategraph::node::NodeContext) -> Result<stategraph::node::PartialUpdate, stategraph::node::NodeError> {
//! #         Ok(stategraph::node::PartialUpdate::default())
//! #     }
//! # }
//!
//! let builder = GraphBuilder::new()
//!     .add_node("a", MyNode)
//!     .add_node("b", MyNode)
//!     .set_entry("a")
//!     .add_edge("a", "b")
//!     .add_edge("b", "End");
//!
//! assert_eq!(builder.nodes_iter().len(), 2);
//! assert_eq!(builder.edges_iter().count(), 3);
//! ```

use crate::plan::Plan;
use crate::types::NodeId;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;
use std::collections::VecDeque;

use super::builder::GraphBuilder;

impl GraphBuilder {
    /// Iterate over the registered node ids.
    #[must_use]
    pub fn nodes_iter(&self) -> NodesIter<'_> {
        NodesIter::new(self.nodes.keys())
    }

    /// Iterate over every static edge as a `(from, to)` pair.
    #[must_use]
    pub fn edges_iter(&self) -> EdgesIter<'_> {
        EdgesIter::new(&self.edges)
    }

    /// Deterministic node ordering over the static edges, for display.
    ///
    /// Kahn's algorithm with lexicographic tie-breaking; `Start` sorts
    /// first and `End` last. Cycles are legal at runtime, so this is an
    /// inspection helper only: nodes on a static cycle are appended after
    /// the acyclic portion, in name order.
    #[must_use]
    pub fn display_order(&self) -> Vec<NodeId> {
        topological_sort(&self.edges)
    }
}

/// The same inspection surface on a compiled plan, so tooling never needs
/// to hold the builder after `compile()`.
impl Plan {
    /// Iterate over the registered node ids.
    #[must_use]
    pub fn nodes_iter(&self) -> NodesIter<'_> {
        NodesIter::new(self.nodes().keys())
    }

    /// Iterate over every static edge as a `(from, to)` pair.
    #[must_use]
    pub fn edges_iter(&self) -> EdgesIter<'_> {
        EdgesIter::new(self.edges())
    }

    /// Deterministic node ordering over the static edges, for display.
    ///
    /// Same contract as [`GraphBuilder::display_order`].
    #[must_use]
    pub fn display_order(&self) -> Vec<NodeId> {
        topological_sort(self.edges())
    }
}

fn display_cmp(a: &NodeId, b: &NodeId) -> Ordering {
    match (a, b) {
        (NodeId::Start, NodeId::Start) | (NodeId::End, NodeId::End) => Ordering::Equal,
        (NodeId::Start, _) => Ordering::Less,
        (_, NodeId::Start) => Ordering::Greater,
        (NodeId::End, _) => Ordering::Greater,
        (_, NodeId::End) => Ordering::Less,
        (NodeId::Named(a_name), NodeId::Named(b_name)) => a_name.cmp(b_name),
    }
}

/// Iterator over node ids in a graph.
///
/// Yields each registered node. Does not include the virtual `Start` or
/// `End` nodes as they are not stored in the node registry.
pub struct NodesIter<'a> {
    inner: std::collections::hash_map::Keys<'a, NodeId, std::sync::Arc<dyn crate::node::Node>>,
}

impl<'a> NodesIter<'a> {
    pub(super) fn new(
        inner: std::collections::hash_map::Keys<'a, NodeId, std::sync::Arc<dyn crate::node::Node>>,
    ) -> Self {
        Self { inner }
    }
}

impl<'a> Iterator for NodesIter<'a> {
    type Item = &'a NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for NodesIter<'_> {}

/// Iterator over static edges in a graph as (source, target) pairs.
///
/// Yields each edge, including edges from `Start` and to `End`. Iteration
/// order follows hash map order and is not deterministic.
pub struct EdgesIter<'a> {
    outer: std::collections::hash_map::Iter<'a, NodeId, Vec<NodeId>>,
    current_from: Option<&'a NodeId>,
    current_targets: std::slice::Iter<'a, NodeId>,
}

impl<'a> EdgesIter<'a> {
    pub(super) fn new(edges: &'a FxHashMap<NodeId, Vec<NodeId>>) -> Self {
        let mut outer = edges.iter();
        let (current_from, current_targets) = match outer.next() {
            Some((from, targets)) => (Some(from), targets.iter()),
            None => (None, [].iter()),
        };
        Self {
            outer,
            current_from,
            current_targets,
        }
    }
}

impl<'a> Iterator for EdgesIter<'a> {
    type Item = (&'a NodeId, &'a NodeId);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(to) = self.current_targets.next() {
                let from = self.current_from?;
                return Some((from, to));
            }
            match self.outer.next() {
                Some((from, targets)) => {
                    self.current_from = Some(from);
                    self.current_targets = targets.iter();
                }
                None => return None,
            }
        }
    }
}

/// Kahn's algorithm with deterministic tie-breaking.
///
/// Nodes on a static cycle never reach in-degree zero; they are appended
/// after the acyclic portion in display order so the result always covers
/// every node mentioned by an edge.
fn topological_sort(edges: &FxHashMap<NodeId, Vec<NodeId>>) -> Vec<NodeId> {
    let mut in_degree: FxHashMap<NodeId, usize> = FxHashMap::default();
    let mut all_nodes: FxHashSet<NodeId> = FxHashSet::default();

    for (from, tos) in edges {
        all_nodes.insert(from.clone());
        in_degree.entry(from.clone()).or_insert(0);
        for to in tos {
            all_nodes.insert(to.clone());
            *in_degree.entry(to.clone()).or_insert(0) += 1;
        }
    }

    let mut zero_in_degree: Vec<NodeId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node, _)| node.clone())
        .collect();
    zero_in_degree.sort_by(display_cmp);

    let mut queue: VecDeque<NodeId> = VecDeque::new();
    queue.extend(zero_in_degree);

    let mut result: Vec<NodeId> = Vec::with_capacity(all_nodes.len());

    while let Some(node) = queue.pop_front() {
        result.push(node.clone());

        if let Some(neighbors) = edges.get(&node) {
            let mut new_zero: Vec<NodeId> = Vec::new();
            for neighbor in neighbors {
                if let Some(degree) = in_degree.get_mut(neighbor) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        new_zero.push(neighbor.clone());
                    }
                }
            }
            new_zero.sort_by(display_cmp);
            queue.extend(new_zero);
        }
    }

    // Cycle members, if any, in display order.
    let mut leftover: Vec<NodeId> = all_nodes
        .into_iter()
        .filter(|node| !result.contains(node))
        .collect();
    leftover.sort_by(display_cmp);
    result.extend(leftover);

    result
}
