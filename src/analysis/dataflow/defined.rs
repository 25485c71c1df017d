//! Defined variable analysis.
//!
//! Forward must-analysis: a variable is defined at a point when every path from entry
//! assigns it first. The meet is intersection, so every node starts out all-ones and only
//! the entry block starts empty.
//!
//! Locals owned by an enclosing scope beyond the scope's parent depth are always defined;
//! the parent initialized their binding cell. A handler reached through an exception edge
//! sees the protected block's state at its start, since the raise may happen before any of
//! the block's own assignments.

use std::collections::BTreeSet;

use crate::{
    analysis::dataflow::{
        framework::{DataFlowProblem, Direction, FlowContext, FlowNode, Solution},
        vars::DataFlowVarIndex,
    },
    ir::{BlockId, Edge, EdgeKind, Instr, Scope, ScopeId, ScopeTree, VarId},
    utils::BitSet,
    Result,
};

/// A read of a variable that some path reaches without an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndefinedVariable {
    /// Block of the read.
    pub block: BlockId,
    /// Position of the reading instruction within the block.
    pub index: usize,
    /// The variable read.
    pub var: VarId,
}

/// Result of [`Solution::identify_inits`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndefinedVariables {
    /// Every undefined read, at most once per variable and block.
    pub uses: Vec<UndefinedVariable>,
    /// The distinct variables involved.
    pub vars: BTreeSet<VarId>,
}

/// Defined variable analysis bound to one scope.
#[derive(Debug, Clone)]
pub struct DefinedVariables {
    scope: ScopeId,
    vars: DataFlowVarIndex,
}

impl DefinedVariables {
    /// Name used in logs and errors.
    pub const NAME: &'static str = "defined-variables";

    /// Creates the problem for `scope`.
    #[must_use]
    pub fn new(scope: ScopeId) -> Self {
        Self {
            scope,
            vars: DataFlowVarIndex::new(Self::NAME),
        }
    }

    /// The dataflow variable index.
    #[must_use]
    pub fn vars(&self) -> &DataFlowVarIndex {
        &self.vars
    }

    fn defined_by_parent(tree: &ScopeTree, scope: &Scope, var: VarId) -> bool {
        tree.variable(var)
            .filter(|v| v.is_local())
            .and_then(|v| v.depth())
            .is_some_and(|depth| depth > scope.parent_scope_depth())
    }

    fn apply(&self, tree: &ScopeTree, scope: &Scope, instr: &Instr, defined: &mut BitSet) -> Result<()> {
        for used in instr.used_variables() {
            if Self::defined_by_parent(tree, scope, used) {
                defined.insert(self.vars.position(used)?);
            }
        }
        if let Some(dst) = instr.result() {
            defined.insert(self.vars.position(dst)?);
        }
        Ok(())
    }
}

impl DataFlowProblem for DefinedVariables {
    type State = BitSet;

    const DIRECTION: Direction = Direction::Forward;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn scope(&self) -> ScopeId {
        self.scope
    }

    fn build_dataflow_vars(&mut self, _tree: &ScopeTree, instr: &Instr) {
        if let Some(dst) = instr.result() {
            self.vars.add(dst);
        }
        for used in instr.used_variables() {
            self.vars.add(used);
        }
    }

    fn initial_state(&self, _cx: &FlowContext<'_, BitSet>, _block: BlockId) -> BitSet {
        BitSet::full(self.vars.len())
    }

    fn pre_meet(&self, cx: &FlowContext<'_, BitSet>, block: BlockId) -> BitSet {
        if block == cx.cfg.entry() {
            self.vars.empty_set()
        } else {
            BitSet::full(self.vars.len())
        }
    }

    fn meet(
        &self,
        _cx: &FlowContext<'_, BitSet>,
        edge: &Edge,
        neighbor: &FlowNode<BitSet>,
        acc: &mut BitSet,
    ) {
        if edge.kind == EdgeKind::Exception {
            acc.intersect_with(&neighbor.in_state);
        } else {
            acc.intersect_with(&neighbor.out_state);
        }
    }

    fn transfer(
        &mut self,
        cx: &FlowContext<'_, BitSet>,
        _block: BlockId,
        instr: &Instr,
        state: &mut BitSet,
    ) -> Result<()> {
        self.apply(cx.tree, cx.scope, instr, state)
    }
}

impl Solution<DefinedVariables> {
    /// Returns `true` if `var` is defined on entry to `block`.
    #[must_use]
    pub fn is_defined_on_entry(&self, block: BlockId, var: VarId) -> bool {
        match (self.in_state(block), self.problem.vars.get(var)) {
            (Some(set), Some(position)) => set.contains(position),
            _ => false,
        }
    }

    /// Finds every read of a variable (other than `self`) that is not defined on all paths.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures.
    pub fn identify_inits(&self, tree: &ScopeTree) -> Result<UndefinedVariables> {
        let scope = tree.scope(self.problem.scope)?;
        let mut report = UndefinedVariables::default();
        for block in scope.cfg.block_ids() {
            let Some(mut defined) = self.in_state(block).cloned() else {
                continue;
            };
            let mut reported = BTreeSet::new();
            for (index, instr) in scope.cfg.instructions(block).iter().enumerate() {
                for used in instr.used_variables() {
                    if tree.vars().is_self(used)
                        || DefinedVariables::defined_by_parent(tree, scope, used)
                        || defined.contains(self.problem.vars.position(used)?)
                    {
                        continue;
                    }
                    if reported.insert(used) {
                        report.uses.push(UndefinedVariable { block, index, var: used });
                        report.vars.insert(used);
                    }
                }
                self.problem.apply(tree, scope, instr, &mut defined)?;
            }
        }
        Ok(report)
    }
}
