//! Minimal graph abstractions shared by the CFG and its traversals.
//!
//! The traversal algorithms in [`traversal`] are written against the [`Successors`]
//! trait, so they work on any graph whose nodes are dense small integers. The
//! [`Cfg`](crate::ir::Cfg) is the only implementor inside the crate.

pub mod traversal;

pub use traversal::{postorder, reachable, reverse_postorder};

/// A node handle that maps onto a dense index `0..node_count`.
pub trait GraphNode: Copy + Eq {
    /// Returns the dense index of this node.
    fn index(self) -> usize;
}

/// Trait for graphs that support forward edge traversal.
///
/// # Required Methods
///
/// - [`node_count`](Successors::node_count) - Upper bound (exclusive) on node indices
/// - [`successors`](Successors::successors) - Returns an iterator over successor nodes
pub trait Successors {
    /// The node handle type.
    type Node: GraphNode;

    /// Returns the number of nodes, i.e. one past the largest node index.
    fn node_count(&self) -> usize;

    /// Returns an iterator over the direct successors of `node`.
    ///
    /// Duplicate successors (two edges to the same target) are permitted and are
    /// visited once by every traversal.
    fn successors(&self, node: Self::Node) -> impl Iterator<Item = Self::Node> + '_;
}
