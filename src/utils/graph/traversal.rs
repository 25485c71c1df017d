//! Depth-first orderings over a [`Successors`] graph.
//!
//! - [`postorder`] - Every node after all of its DFS descendants (backward data flow)
//! - [`reverse_postorder`] - Every node before its successors in a DAG (forward data flow)
//! - [`reachable`] - Reachability flags from a start node
//!
//! Nodes not reachable from the start node are not part of any ordering.

use crate::utils::graph::{GraphNode, Successors};

/// Computes the postorder traversal of nodes reachable from `start`.
///
/// The traversal is iterative with an explicit stack, so deeply nested CFGs cannot
/// overflow the call stack. Successors are explored in their iteration order.
///
/// # Arguments
///
/// * `graph` - The graph to traverse
/// * `start` - The starting node for traversal
///
/// # Returns
///
/// The reachable nodes in postorder, or an empty vector when `start` is out of range.
///
/// # Complexity
///
/// - Time: O(V + E)
/// - Space: O(V)
#[allow(clippy::items_after_statements)]
pub fn postorder<G: Successors>(graph: &G, start: G::Node) -> Vec<G::Node> {
    let node_count = graph.node_count();
    if start.index() >= node_count {
        return Vec::new();
    }

    let mut visited = vec![false; node_count];
    let mut result = Vec::with_capacity(node_count);

    #[derive(Clone, Copy)]
    enum State {
        Enter,
        Exit,
    }

    let mut stack = vec![(start, State::Enter)];

    while let Some((node, state)) = stack.pop() {
        match state {
            State::Enter => {
                if visited[node.index()] {
                    continue;
                }
                visited[node.index()] = true;
                stack.push((node, State::Exit));

                // Reverse so the first successor is explored first
                let successors: Vec<G::Node> = graph.successors(node).collect();
                for &succ in successors.iter().rev() {
                    if !visited[succ.index()] {
                        stack.push((succ, State::Enter));
                    }
                }
            }
            State::Exit => result.push(node),
        }
    }

    result
}

/// Computes the reverse postorder traversal of nodes reachable from `start`.
///
/// This is the preferred iteration order for forward data flow analysis: in an
/// acyclic region every block is visited after all of its predecessors.
///
/// # Arguments
///
/// * `graph` - The graph to traverse
/// * `start` - The starting node for traversal
///
/// # Returns
///
/// The reachable nodes in reverse postorder.
pub fn reverse_postorder<G: Successors>(graph: &G, start: G::Node) -> Vec<G::Node> {
    let mut order = postorder(graph, start);
    order.reverse();
    order
}

/// Reports which nodes are reachable from `start`, indexed by node index.
pub fn reachable<G: Successors>(graph: &G, start: G::Node) -> Vec<bool> {
    let mut flags = vec![false; graph.node_count()];
    for node in postorder(graph, start) {
        flags[node.index()] = true;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct N(usize);

    impl GraphNode for N {
        fn index(self) -> usize {
            self.0
        }
    }

    struct Adjacency(Vec<Vec<usize>>);

    impl Successors for Adjacency {
        type Node = N;

        fn node_count(&self) -> usize {
            self.0.len()
        }

        fn successors(&self, node: N) -> impl Iterator<Item = N> + '_ {
            self.0[node.0].iter().map(|&s| N(s))
        }
    }

    #[test]
    fn test_postorder_diamond() {
        // 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3
        let g = Adjacency(vec![vec![1, 2], vec![3], vec![3], vec![]]);
        assert_eq!(postorder(&g, N(0)), vec![N(3), N(1), N(2), N(0)]);
        assert_eq!(reverse_postorder(&g, N(0)), vec![N(0), N(2), N(1), N(3)]);
    }

    #[test]
    fn test_postorder_loop_and_unreachable() {
        // 0 -> 1 -> 2 -> 1, node 3 is unreachable
        let g = Adjacency(vec![vec![1], vec![2], vec![1], vec![0]]);
        let order = postorder(&g, N(0));
        assert_eq!(order, vec![N(2), N(1), N(0)]);
        assert_eq!(reachable(&g, N(0)), vec![true, true, true, false]);
    }

    #[test]
    fn test_postorder_invalid_start() {
        let g = Adjacency(vec![vec![]]);
        assert!(postorder(&g, N(4)).is_empty());
    }
}
