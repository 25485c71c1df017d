//! Live variable analysis.
//!
//! A variable is live at a program point if its current value may still be read on some
//! path from that point before being overwritten. This is a backward problem whose meet
//! is union:
//!
//! - `live_out(B) = ∪ live_in(S)` over every successor `S`, exception edges included
//! - `live_in(B)`: replay the block bottom-up; a definition kills, a use generates
//!
//! On top of the textbook rules the transfer models the closure compiler's environment:
//!
//! - **Barriers.** An instruction that hands a real sub-closure to its callee, a call whose
//!   target may read the caller's binding, or any closure-accepting instruction in a scope
//!   whose binding escaped, makes every local live. The callee may read any of them.
//! - **Exceptions.** At an instruction that may raise inside a protected block, whatever is
//!   live at the start of the handler is live too.
//! - **Scope exit.** Variables the enclosing scope still needs after the closure returns
//!   are seeded at the exit block.
//! - **Strong liveness.** An instruction that is removable (no effect, cannot raise) and
//!   whose result is dead contributes no uses. [`Solution::mark_dead_instructions`]
//!   deletes exactly these, so deleting them never changes any block's liveness.

use std::collections::BTreeSet;

use crate::{
    analysis::dataflow::{
        framework::{DataFlowProblem, Direction, FlowContext, FlowNode, Solution},
        vars::DataFlowVarIndex,
    },
    ir::{BlockId, Edge, Instr, ScopeId, ScopeTree, VarId},
    utils::BitSet,
    Result,
};

/// Live variable analysis bound to one scope.
#[derive(Debug, Clone)]
pub struct LiveVariables {
    scope: ScopeId,
    vars: DataFlowVarIndex,
    locals: Vec<VarId>,
    live_on_exit: BTreeSet<VarId>,
    binding_escaped: bool,
}

impl LiveVariables {
    /// Name used in logs and errors.
    pub const NAME: &'static str = "live-variables";

    /// Creates the problem for `scope`.
    ///
    /// `live_on_exit` lists the variables still needed once the scope finishes; for a
    /// closure these are the enclosing scope's locals live after the call, expressed in the
    /// closure's own variable names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`](crate::Error::UnknownScope) for a foreign scope.
    pub fn new(
        tree: &ScopeTree,
        scope: ScopeId,
        live_on_exit: impl IntoIterator<Item = VarId>,
    ) -> Result<Self> {
        let mut problem = Self {
            scope,
            vars: DataFlowVarIndex::new(Self::NAME),
            locals: Vec::new(),
            live_on_exit: live_on_exit.into_iter().collect(),
            binding_escaped: tree.scope(scope)?.binding_has_escaped(),
        };
        let seeded: Vec<VarId> = problem.live_on_exit.iter().copied().collect();
        for var in seeded {
            problem.register(tree, var);
        }
        Ok(problem)
    }

    fn register(&mut self, tree: &ScopeTree, var: VarId) {
        let known = self.vars.get(var).is_some();
        self.vars.add(var);
        if !known && tree.vars().is_local(var) {
            self.locals.push(var);
        }
    }

    /// The dataflow variable index.
    #[must_use]
    pub fn vars(&self) -> &DataFlowVarIndex {
        &self.vars
    }

    /// Every non-self non-block local variable the problem knows about.
    #[must_use]
    pub fn local_vars(&self) -> &[VarId] {
        &self.locals
    }

    fn is_barrier(&self, instr: &Instr) -> bool {
        instr.accepts_closure()
            && (instr.sub_closure().is_some()
                || self.binding_escaped
                || instr.requires_callers_binding())
    }

    /// Applies `instr` to `live` (the set live just after it).
    ///
    /// Returns `true` if the instruction is dead: it was left out of the state entirely.
    fn apply(
        &self,
        cx: &FlowContext<'_, BitSet>,
        block: BlockId,
        instr: &Instr,
        live: &mut BitSet,
    ) -> Result<bool> {
        match instr.result() {
            Some(dst) => {
                let position = self.vars.position(dst)?;
                if instr.is_removable() && !live.contains(position) {
                    return Ok(true);
                }
                live.remove(position);
            }
            None if instr.is_removable() => return Ok(true),
            None => {}
        }

        if self.is_barrier(instr) {
            for &local in &self.locals {
                live.insert(self.vars.position(local)?);
            }
        }

        if instr.can_raise() {
            if let Some(handler) = cx.cfg.rescuer(block).and_then(|r| cx.node(r)) {
                live.union_with(&handler.out_state);
            }
        }

        for used in instr.used_variables() {
            live.insert(self.vars.position(used)?);
        }
        Ok(false)
    }
}

impl DataFlowProblem for LiveVariables {
    type State = BitSet;

    const DIRECTION: Direction = Direction::Backward;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn scope(&self) -> ScopeId {
        self.scope
    }

    fn build_dataflow_vars(&mut self, tree: &ScopeTree, instr: &Instr) {
        if let Some(dst) = instr.result() {
            self.register(tree, dst);
        }
        for used in instr.used_variables() {
            self.register(tree, used);
        }
    }

    fn initial_state(&self, _cx: &FlowContext<'_, BitSet>, _block: BlockId) -> BitSet {
        self.vars.empty_set()
    }

    fn pre_meet(&self, cx: &FlowContext<'_, BitSet>, block: BlockId) -> BitSet {
        let mut live = self.vars.empty_set();
        if block == cx.cfg.exit() {
            for position in self.live_on_exit.iter().filter_map(|&v| self.vars.get(v)) {
                live.insert(position);
            }
        }
        live
    }

    fn meet(
        &self,
        _cx: &FlowContext<'_, BitSet>,
        _edge: &Edge,
        neighbor: &FlowNode<BitSet>,
        acc: &mut BitSet,
    ) {
        acc.union_with(&neighbor.out_state);
    }

    fn transfer(
        &mut self,
        cx: &FlowContext<'_, BitSet>,
        block: BlockId,
        instr: &Instr,
        state: &mut BitSet,
    ) -> Result<()> {
        self.apply(cx, block, instr, state)?;
        Ok(())
    }
}

/// Dead instructions of a scope, as positions into each block's instruction list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadInstructions {
    /// `(block, ascending positions)` for every block with at least one dead instruction.
    pub blocks: Vec<(BlockId, Vec<usize>)>,
}

impl DeadInstructions {
    /// Total number of dead instructions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.blocks.iter().map(|(_, p)| p.len()).sum()
    }
}

impl Solution<LiveVariables> {
    fn decode(&self, set: Option<&BitSet>) -> Option<BTreeSet<VarId>> {
        set.map(|s| self.problem.vars.decode(s).collect())
    }

    /// Variables live on entry to `block`; `None` if the block is unreachable.
    #[must_use]
    pub fn live_in(&self, block: BlockId) -> Option<BTreeSet<VarId>> {
        self.decode(self.out_state(block))
    }

    /// Variables live on exit from `block`; `None` if the block is unreachable.
    #[must_use]
    pub fn live_out(&self, block: BlockId) -> Option<BTreeSet<VarId>> {
        self.decode(self.in_state(block))
    }

    /// Raw live-in bit set of `block`, indexed by [`LiveVariables::vars`].
    #[must_use]
    pub fn live_in_bitset(&self, block: BlockId) -> Option<&BitSet> {
        self.out_state(block)
    }

    /// Raw live-out bit set of `block`, indexed by [`LiveVariables::vars`].
    #[must_use]
    pub fn live_out_bitset(&self, block: BlockId) -> Option<&BitSet> {
        self.in_state(block)
    }

    /// Returns `true` if `var` is live on entry to `block`.
    #[must_use]
    pub fn is_live_in(&self, block: BlockId, var: VarId) -> bool {
        match (self.out_state(block), self.problem.vars.get(var)) {
            (Some(set), Some(position)) => set.contains(position),
            _ => false,
        }
    }

    /// Variables live on entry to the scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`](crate::Error::UnknownScope) for a foreign tree.
    pub fn vars_live_on_scope_entry(&self, tree: &ScopeTree) -> Result<BTreeSet<VarId>> {
        let entry = tree.cfg(self.problem.scope)?.entry();
        Ok(self.live_in(entry).unwrap_or_default())
    }

    /// Variables the surrounding code needs after the scope finishes.
    #[must_use]
    pub fn vars_live_on_scope_exit(&self) -> &BTreeSet<VarId> {
        &self.problem.live_on_exit
    }

    /// Variables live immediately after instruction `index` of `block`.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures.
    pub fn live_after(&self, tree: &ScopeTree, block: BlockId, index: usize) -> Result<BTreeSet<VarId>> {
        let scope = tree.scope(self.problem.scope)?;
        let Some(mut live) = self.in_state(block).cloned() else {
            return Ok(BTreeSet::new());
        };
        let cx = FlowContext::new(tree, scope, &self.nodes);
        for instr in scope.cfg.instructions(block).iter().skip(index + 1).rev() {
            self.problem.apply(&cx, block, instr, &mut live)?;
        }
        Ok(self.problem.vars.decode(&live).collect())
    }

    /// Finds the instructions whose effect is unobservable.
    ///
    /// A result-producing removable instruction is dead when its result is not live after
    /// it. Every instruction of an unreachable block is dead.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures.
    pub fn dead_instructions(&self, tree: &ScopeTree) -> Result<DeadInstructions> {
        let scope = tree.scope(self.problem.scope)?;
        let cx = FlowContext::new(tree, scope, &self.nodes);
        let mut dead = DeadInstructions::default();
        for block in scope.cfg.block_ids() {
            let instrs = scope.cfg.instructions(block);
            if instrs.is_empty() {
                continue;
            }
            let Some(mut live) = self.in_state(block).cloned() else {
                dead.blocks.push((block, (0..instrs.len()).collect()));
                continue;
            };
            let mut positions = Vec::new();
            for (position, instr) in instrs.iter().enumerate().rev() {
                if self.problem.apply(&cx, block, instr, &mut live)? {
                    positions.push(position);
                }
            }
            if !positions.is_empty() {
                positions.reverse();
                dead.blocks.push((block, positions));
            }
        }
        Ok(dead)
    }

    /// Deletes the instructions reported by [`dead_instructions`](Self::dead_instructions).
    ///
    /// Returns the deleted instructions. The solution describes the pre-deletion IR; its
    /// live sets remain exact because dead instructions never contributed to them.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures.
    pub fn mark_dead_instructions(&self, tree: &mut ScopeTree) -> Result<Vec<(BlockId, Instr)>> {
        let dead = self.dead_instructions(tree)?;
        let cfg = tree.cfg_mut(self.problem.scope)?;
        let mut removed = Vec::new();
        for (block, positions) in dead.blocks {
            let old = cfg.replace_instructions(block, Vec::new()).unwrap_or_default();
            let mut kept = Vec::with_capacity(old.len() - positions.len());
            let mut next_dead = positions.iter().peekable();
            for (position, instr) in old.into_iter().enumerate() {
                if next_dead.peek() == Some(&&position) {
                    next_dead.next();
                    removed.push((block, instr));
                } else {
                    kept.push(instr);
                }
            }
            cfg.replace_instructions(block, kept);
        }
        Ok(removed)
    }
}
