//! Core traits and types of the fixed-point dataflow framework.
//!
//! A concrete analysis implements [`DataFlowProblem`]: it picks a [`Direction`], a state
//! type, how neighbor states combine into a block's starting state (the *meet*), and how
//! each instruction transforms the state (the *transfer*). The
//! [`DataFlowSolver`](super::DataFlowSolver) owns one [`FlowNode`] per basic block and drives
//! the hooks until no block's published state changes.
//!
//! # Vocabulary
//!
//! States are named in the direction of flow:
//!
//! | Direction  | `in_state(b)`                        | `out_state(b)`                    |
//! |------------|--------------------------------------|-----------------------------------|
//! | `Forward`  | meet over predecessors: start of `b` | after the last instruction of `b` |
//! | `Backward` | meet over successors: end of `b`     | before the first instruction      |

use std::fmt;

use crate::{
    ir::{BlockId, Cfg, Edge, Instr, Scope, ScopeId, ScopeTree},
    Result,
};

/// Direction of information flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Information flows from entry towards exit.
    Forward,
    /// Information flows from exit towards entry.
    Backward,
}

/// Per-block analysis state owned by the solver.
///
/// `out_state` is only ever replaced as a whole once every instruction of the block has
/// been processed, so neighbors never observe a partially transferred state.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowNode<S> {
    pub(crate) in_state: S,
    pub(crate) out_state: S,
    pub(crate) computed: bool,
}

impl<S> FlowNode<S> {
    /// The meet of the neighbor states (see the module docs for orientation).
    #[must_use]
    pub fn in_state(&self) -> &S {
        &self.in_state
    }

    /// The state published after transferring the whole block.
    #[must_use]
    pub fn out_state(&self) -> &S {
        &self.out_state
    }

    /// `false` while the block was never visited, which for solved problems means it is
    /// unreachable from the entry block.
    #[must_use]
    pub const fn is_computed(&self) -> bool {
        self.computed
    }
}

/// Read-only view of the problem's surroundings, handed to every hook.
pub struct FlowContext<'a, S> {
    /// The scope tree being analyzed.
    pub tree: &'a ScopeTree,
    /// The scope the problem is bound to.
    pub scope: &'a Scope,
    /// That scope's CFG.
    pub cfg: &'a Cfg,
    pub(crate) nodes: &'a [FlowNode<S>],
}

impl<'a, S> FlowContext<'a, S> {
    pub(crate) fn new(tree: &'a ScopeTree, scope: &'a Scope, nodes: &'a [FlowNode<S>]) -> Self {
        Self {
            tree,
            scope,
            cfg: &scope.cfg,
            nodes,
        }
    }

    /// Returns the node of another block, as last published.
    #[must_use]
    pub fn node(&self, block: BlockId) -> Option<&FlowNode<S>> {
        self.nodes.get(block.index())
    }

    /// Returns the scope handle.
    #[must_use]
    pub fn scope_id(&self) -> ScopeId {
        self.scope.id
    }
}

/// A monotone dataflow problem bound to one scope.
///
/// The solver calls [`build_dataflow_vars`](Self::build_dataflow_vars) for every
/// instruction in program order before the first visit, so any index the problem keeps is
/// complete by the time [`transfer`](Self::transfer) runs. Per visited block the solver then
/// calls `pre_meet`, `meet` once per neighbor edge, `init_solution`, and `transfer` once
/// per instruction in the direction's order.
pub trait DataFlowProblem {
    /// The per-block state.
    type State: Clone + fmt::Debug + PartialEq;

    /// The direction of information flow.
    const DIRECTION: Direction;

    /// Short name, used in errors and logs.
    fn name(&self) -> &'static str;

    /// The scope this problem is bound to.
    fn scope(&self) -> ScopeId;

    /// Registers the variables `instr` mentions with the problem's index.
    fn build_dataflow_vars(&mut self, _tree: &ScopeTree, _instr: &Instr) {}

    /// The state every node publishes before its first visit.
    ///
    /// Must be the identity of [`meet`](Self::meet) so that unvisited neighbors do not
    /// constrain the result.
    fn initial_state(&self, cx: &FlowContext<'_, Self::State>, block: BlockId) -> Self::State;

    /// The accumulator a visit starts from, before any neighbor is folded in.
    fn pre_meet(&self, cx: &FlowContext<'_, Self::State>, block: BlockId) -> Self::State {
        self.initial_state(cx, block)
    }

    /// Folds the neighbor across `edge` into `acc`.
    ///
    /// The neighbor is the edge's source for forward problems and its target for backward
    /// problems.
    fn meet(
        &self,
        cx: &FlowContext<'_, Self::State>,
        edge: &Edge,
        neighbor: &FlowNode<Self::State>,
        acc: &mut Self::State,
    );

    /// Adjusts the working state after the meet, before the first transfer.
    fn init_solution(
        &self,
        _cx: &FlowContext<'_, Self::State>,
        _block: BlockId,
        _state: &mut Self::State,
    ) {
    }

    /// Applies one instruction to the working state.
    ///
    /// # Errors
    ///
    /// Returns an error on an internal-consistency violation, which aborts the solve.
    fn transfer(
        &mut self,
        cx: &FlowContext<'_, Self::State>,
        block: BlockId,
        instr: &Instr,
        state: &mut Self::State,
    ) -> Result<()>;
}

/// Meets the neighbors of `block` and transfers the whole block.
///
/// Returns the post-meet state and the transferred state.
pub(crate) fn compute_node<P: DataFlowProblem>(
    problem: &mut P,
    cx: &FlowContext<'_, P::State>,
    block: BlockId,
) -> Result<(P::State, P::State)> {
    let mut acc = problem.pre_meet(cx, block);
    match P::DIRECTION {
        Direction::Forward => {
            for edge in cx.cfg.incoming_edges(block) {
                if let Some(neighbor) = cx.node(edge.source) {
                    problem.meet(cx, edge, neighbor, &mut acc);
                }
            }
        }
        Direction::Backward => {
            for edge in cx.cfg.outgoing_edges(block) {
                if let Some(neighbor) = cx.node(edge.target) {
                    problem.meet(cx, edge, neighbor, &mut acc);
                }
            }
        }
    }

    let mut working = acc.clone();
    problem.init_solution(cx, block, &mut working);
    let instrs = cx.cfg.instructions(block);
    match P::DIRECTION {
        Direction::Forward => {
            for instr in instrs {
                problem.transfer(cx, block, instr, &mut working)?;
            }
        }
        Direction::Backward => {
            for instr in instrs.iter().rev() {
                problem.transfer(cx, block, instr, &mut working)?;
            }
        }
    }
    Ok((acc, working))
}

/// A solved problem together with its per-block states.
pub struct Solution<P: DataFlowProblem> {
    pub(crate) problem: P,
    pub(crate) nodes: Vec<FlowNode<P::State>>,
    pub(crate) visits: usize,
}

impl<P: DataFlowProblem> Solution<P> {
    /// The solved problem.
    #[must_use]
    pub fn problem(&self) -> &P {
        &self.problem
    }

    /// The solved problem, mutably (for rewrite passes that replay the transfer).
    pub fn problem_mut(&mut self) -> &mut P {
        &mut self.problem
    }

    /// Returns the node of `block`.
    #[must_use]
    pub fn node(&self, block: BlockId) -> Option<&FlowNode<P::State>> {
        self.nodes.get(block.index())
    }

    /// Returns the post-meet state of `block`, if it was computed.
    #[must_use]
    pub fn in_state(&self, block: BlockId) -> Option<&P::State> {
        self.node(block).filter(|n| n.computed).map(|n| &n.in_state)
    }

    /// Returns the published state of `block`, if it was computed.
    #[must_use]
    pub fn out_state(&self, block: BlockId) -> Option<&P::State> {
        self.node(block).filter(|n| n.computed).map(|n| &n.out_state)
    }

    /// Returns `true` if `block` was visited.
    #[must_use]
    pub fn is_computed(&self, block: BlockId) -> bool {
        self.node(block).is_some_and(FlowNode::is_computed)
    }

    /// Number of block visits the solve took.
    #[must_use]
    pub const fn visits(&self) -> usize {
        self.visits
    }

    /// Number of nodes (blocks at solve time).
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.nodes.len()
    }

    /// Re-runs meet and transfer once over every computed block and reports whether every
    /// state is reproduced exactly.
    ///
    /// # Errors
    ///
    /// Propagates transfer errors and [`Error::UnknownScope`](crate::Error::UnknownScope).
    pub fn is_fixpoint(&mut self, tree: &ScopeTree) -> Result<bool> {
        let scope = tree.scope(self.problem.scope())?;
        let cx = FlowContext::new(tree, scope, &self.nodes);
        for (index, node) in self.nodes.iter().enumerate() {
            if !node.computed {
                continue;
            }
            let (acc, out) = compute_node(&mut self.problem, &cx, BlockId(index))?;
            if acc != node.in_state || out != node.out_state {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl<P: DataFlowProblem> fmt::Debug for Solution<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Solution")
            .field("problem", &self.problem.name())
            .field("nodes", &self.nodes)
            .field("visits", &self.visits)
            .finish()
    }
}
