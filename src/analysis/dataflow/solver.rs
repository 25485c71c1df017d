//! Worklist-based fixed-point solver.
//!
//! # Algorithm
//!
//! 1. Call `build_dataflow_vars` for every instruction, in program order
//! 2. Publish `initial_state` for every block
//! 3. Enqueue every block reachable from entry, in reverse postorder (forward) or
//!    postorder (backward); the order only affects speed, never the result
//! 4. While the worklist is non-empty:
//!    a. Remove a block from the worklist
//!    b. Meet its neighbors, then transfer the whole block into a working copy
//!    c. Publish the working copy; if it differs from the previous one, enqueue the
//!    blocks that read it (successors forward, predecessors backward)
//!
//! Unreachable blocks are never visited and keep their initial state. The number of
//! visits is bounded; a problem that exceeds the bound is not monotone and the solve fails
//! with [`Error::NonConvergence`].
//!
//! # Complexity
//!
//! For the shipped lattices each block's state can only move a bounded number of times,
//! so the total work is O(n * h) visits where h is the lattice height.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::{
    analysis::dataflow::framework::{
        compute_node, DataFlowProblem, Direction, FlowContext, FlowNode, Solution,
    },
    ir::{BlockId, ScopeTree},
    Error, Result,
};

/// Default bound on the number of visits per block.
pub const DEFAULT_MAX_VISITS_PER_BLOCK: usize = 1000;

type Observer<S> = Box<dyn FnMut(BlockId, &S)>;

/// Worklist-based data flow solver.
///
/// # Usage
///
/// ```rust,ignore
/// use scopeflow::analysis::dataflow::{DataFlowSolver, LiveVariables};
///
/// let problem = LiveVariables::new(&tree, scope, live_on_exit)?;
/// let solution = DataFlowSolver::new(problem).solve(&tree)?;
/// let live = solution.live_in(block);
/// ```
pub struct DataFlowSolver<P: DataFlowProblem> {
    /// The problem being solved.
    problem: P,
    /// One node per block.
    nodes: Vec<FlowNode<P::State>>,
    /// Worklist of blocks to process.
    worklist: VecDeque<BlockId>,
    /// Whether each block is currently in the worklist (for deduplication).
    in_worklist: Vec<bool>,
    /// Whether each block takes part in the solve at all.
    reachable: Vec<bool>,
    /// Number of block visits performed.
    visits: usize,
    /// Visit bound per block.
    max_visits_per_block: usize,
    /// Called with every published state.
    observer: Option<Observer<P::State>>,
}

impl<P: DataFlowProblem> DataFlowSolver<P> {
    /// Creates a new solver for the given problem.
    #[must_use]
    pub fn new(problem: P) -> Self {
        Self {
            problem,
            nodes: Vec::new(),
            worklist: VecDeque::new(),
            in_worklist: Vec::new(),
            reachable: Vec::new(),
            visits: 0,
            max_visits_per_block: DEFAULT_MAX_VISITS_PER_BLOCK,
            observer: None,
        }
    }

    /// Overrides the per-block visit bound.
    #[must_use]
    pub fn with_visit_limit(mut self, max_visits_per_block: usize) -> Self {
        self.max_visits_per_block = max_visits_per_block.max(1);
        self
    }

    /// Installs a callback receiving every state the solver publishes, in order.
    #[must_use]
    pub fn with_observer(mut self, observer: impl FnMut(BlockId, &P::State) + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Solves the problem to a fixpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NonConvergence`] when the visit bound is exceeded, or any error a
    /// transfer function raises.
    pub fn solve(mut self, tree: &ScopeTree) -> Result<Solution<P>> {
        let scope = tree.scope(self.problem.scope())?;
        let cfg = &scope.cfg;

        for block in cfg.blocks() {
            for instr in &block.instrs {
                self.problem.build_dataflow_vars(tree, instr);
            }
        }

        let block_count = cfg.block_count();
        {
            let cx = FlowContext::new(tree, scope, &[]);
            self.nodes = cfg
                .block_ids()
                .map(|b| {
                    let state = self.problem.initial_state(&cx, b);
                    FlowNode {
                        in_state: state.clone(),
                        out_state: state,
                        computed: false,
                    }
                })
                .collect();
        }

        let order = match P::DIRECTION {
            Direction::Forward => cfg.reverse_postorder(),
            Direction::Backward => cfg.postorder(),
        };
        self.in_worklist = vec![false; block_count];
        self.reachable = vec![false; block_count];
        for block in order {
            self.reachable[block.index()] = true;
            self.in_worklist[block.index()] = true;
            self.worklist.push_back(block);
        }

        let limit = self.max_visits_per_block.saturating_mul(block_count.max(1));
        while let Some(block) = self.worklist.pop_front() {
            self.in_worklist[block.index()] = false;
            self.visits += 1;
            if self.visits > limit {
                return Err(Error::NonConvergence {
                    problem: self.problem.name(),
                    scope: scope.id,
                    visits: self.visits - 1,
                });
            }

            let (in_state, out_state) = {
                let cx = FlowContext::new(tree, scope, &self.nodes);
                compute_node(&mut self.problem, &cx, block)?
            };

            let node = &mut self.nodes[block.index()];
            let changed = node.out_state != out_state || node.in_state != in_state;
            node.in_state = in_state;
            node.out_state = out_state;
            node.computed = true;
            trace!(problem = self.problem.name(), %block, state = ?node.out_state, "published");
            if let Some(observer) = self.observer.as_mut() {
                observer(block, &node.out_state);
            }

            if changed {
                self.enqueue_dependents(tree, block)?;
            }
        }

        debug!(
            problem = self.problem.name(),
            scope = %scope.id,
            blocks = block_count,
            visits = self.visits,
            "dataflow solved"
        );

        Ok(Solution {
            problem: self.problem,
            nodes: self.nodes,
            visits: self.visits,
        })
    }

    /// Adds the blocks whose meet reads `block`'s published state.
    fn enqueue_dependents(&mut self, tree: &ScopeTree, block: BlockId) -> Result<()> {
        let cfg = tree.cfg(self.problem.scope())?;
        let dependents: Vec<BlockId> = match P::DIRECTION {
            Direction::Forward => cfg.successors_of(block).collect(),
            Direction::Backward => cfg.predecessors_of(block).collect(),
        };
        for dep in dependents {
            let index = dep.index();
            if self.reachable[index] && !self.in_worklist[index] {
                self.in_worklist[index] = true;
                self.worklist.push_back(dep);
            }
        }
        Ok(())
    }
}
