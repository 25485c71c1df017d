//! Load placement: where local variables must be re-read from their binding.
//!
//! Backward union over the set of locals whose temporary must be refreshed from the heap
//! binding before their next use. A use makes a local required; its definition satisfies
//! the requirement. Loads are placed:
//!
//! - right after a call passing a real sub-closure, for the locals the closure writes
//! - right after any call, for locals the scope never writes itself (or everything when the
//!   binding escaped)
//! - right after a global write in an escaped scope
//! - at the start of a rescue entry, after its `ReceiveException`
//! - at the start of a closure's entry block
//!
//! Rescue entries do not propagate their requirements to the blocks they protect, since
//! they reload on their own entry. Once loads are in place every instruction of the scope
//! is renamed through the [`RenameMap`] shared with store placement.

use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use crate::{
    analysis::dataflow::{
        framework::{DataFlowProblem, Direction, FlowContext, FlowNode, Solution},
        stores::RenameMap,
        vars::DataFlowVarIndex,
    },
    ir::{BindingSlot, BlockId, Edge, Instr, ScopeId, ScopeTree, VarId, VariableKind},
    utils::BitSet,
    Error, Result,
};

/// Loads to insert into one block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockLoads {
    /// The block.
    pub block: BlockId,
    /// Locals loaded at the start of the block.
    pub at_start: Vec<VarId>,
    /// `(position, locals)`: load `locals` right after instruction `position`.
    pub after: Vec<(usize, Vec<VarId>)>,
}

/// Output of [`Solution::plan_loads`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadPlan {
    /// Per-block insertions, for blocks with at least one load.
    pub blocks: Vec<BlockLoads>,
}

impl LoadPlan {
    /// Number of planned loads.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.at_start.len() + b.after.iter().map(|(_, v)| v.len()).sum::<usize>())
            .sum()
    }
}

/// Load placement bound to one scope.
#[derive(Debug, Clone)]
pub struct LoadPlacement {
    scope: ScopeId,
    vars: DataFlowVarIndex,
    in_closure: bool,
    binding_escaped: bool,
    scope_defines: BTreeSet<BindingSlot>,
    closure_defines: HashMap<ScopeId, BTreeSet<BindingSlot>>,
}

impl LoadPlacement {
    /// Name used in logs and errors.
    pub const NAME: &'static str = "load-placement";

    /// Creates the problem for `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`] for a foreign scope.
    pub fn new(tree: &ScopeTree, scope: ScopeId) -> Result<Self> {
        let s = tree.scope(scope)?;
        let mut closure_defines = HashMap::new();
        for &closure in &s.closures {
            closure_defines.insert(closure, tree.local_usage(closure)?.defined);
        }
        Ok(Self {
            scope,
            vars: DataFlowVarIndex::new(Self::NAME),
            in_closure: s.is_closure(),
            binding_escaped: s.binding_has_escaped(),
            scope_defines: tree.local_usage(scope)?.defined,
            closure_defines,
        })
    }

    /// The dataflow variable index.
    #[must_use]
    pub fn vars(&self) -> &DataFlowVarIndex {
        &self.vars
    }

    fn slot_in(tree: &ScopeTree, slots: Option<&BTreeSet<BindingSlot>>, var: VarId) -> bool {
        match (slots, tree.slot(var)) {
            (Some(slots), Some(slot)) => slots.contains(slot),
            // Unknown closures may write anything
            (None, _) => true,
            (Some(_), None) => false,
        }
    }

    fn step(&self, tree: &ScopeTree, instr: &Instr, required: &mut BitSet) -> Result<BitSet> {
        let mut after = self.vars.empty_set();
        if let Some(dst) = instr.result() {
            if tree.vars().is_local(dst) {
                required.remove(self.vars.position(dst)?);
            }
        }

        if instr.accepts_closure() {
            if let Some(closure) = instr.sub_closure() {
                let defines = self.closure_defines.get(&closure);
                for position in required.iter() {
                    if self.vars.var(position).is_some_and(|v| Self::slot_in(tree, defines, v)) {
                        after.insert(position);
                    }
                }
            }
            if self.binding_escaped || instr.requires_callers_binding() {
                after.union_with(required);
            } else {
                for position in required.iter() {
                    let foreign = self
                        .vars
                        .var(position)
                        .is_some_and(|v| !Self::slot_in(tree, Some(&self.scope_defines), v));
                    if foreign {
                        after.insert(position);
                    }
                }
            }
        }
        if matches!(instr, Instr::PutGlobal { .. }) && self.binding_escaped {
            after.union_with(required);
        }
        required.difference_with(&after);

        for used in instr.used_variables() {
            if tree.vars().is_local(used) {
                required.insert(self.vars.position(used)?);
            }
        }
        if let Instr::StoreBinding { slot, .. } = instr {
            if tree.vars().is_local(*slot) {
                required.insert(self.vars.position(*slot)?);
            }
        }
        Ok(after)
    }
}

impl DataFlowProblem for LoadPlacement {
    type State = BitSet;

    const DIRECTION: Direction = Direction::Backward;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn scope(&self) -> ScopeId {
        self.scope
    }

    fn build_dataflow_vars(&mut self, tree: &ScopeTree, instr: &Instr) {
        let slot = match instr {
            Instr::StoreBinding { slot, .. } => Some(*slot),
            _ => None,
        };
        for var in instr
            .result()
            .into_iter()
            .chain(instr.used_variables())
            .chain(slot)
        {
            if tree.vars().is_local(var) {
                self.vars.add(var);
            }
        }
    }

    fn initial_state(&self, _cx: &FlowContext<'_, BitSet>, _block: BlockId) -> BitSet {
        self.vars.empty_set()
    }

    fn meet(
        &self,
        cx: &FlowContext<'_, BitSet>,
        edge: &Edge,
        neighbor: &FlowNode<BitSet>,
        acc: &mut BitSet,
    ) {
        if !cx.cfg.is_rescue_entry(edge.target) {
            acc.union_with(&neighbor.out_state);
        }
    }

    fn transfer(
        &mut self,
        cx: &FlowContext<'_, BitSet>,
        _block: BlockId,
        instr: &Instr,
        state: &mut BitSet,
    ) -> Result<()> {
        self.step(cx.tree, instr, state)?;
        Ok(())
    }
}

impl Solution<LoadPlacement> {
    fn decode_sorted(&self, set: &BitSet) -> Vec<VarId> {
        let mut vars: Vec<VarId> = self.problem.vars.decode(set).collect();
        vars.sort_unstable();
        vars
    }

    /// Locals required on entry to `block`.
    #[must_use]
    pub fn required_on_entry(&self, block: BlockId) -> Option<BTreeSet<VarId>> {
        self.out_state(block)
            .map(|s| self.problem.vars.decode(s).collect())
    }

    /// Replays every block and lists the loads to insert.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures.
    pub fn plan_loads(&self, tree: &ScopeTree) -> Result<LoadPlan> {
        let scope = tree.scope(self.problem.scope)?;
        let cfg = &scope.cfg;
        let mut plan = LoadPlan::default();
        for block in cfg.block_ids() {
            let Some(mut required) = self.in_state(block).cloned() else {
                continue;
            };
            let mut loads = BlockLoads {
                block,
                ..BlockLoads::default()
            };
            for (position, instr) in cfg.instructions(block).iter().enumerate().rev() {
                let after = self.problem.step(tree, instr, &mut required)?;
                if !after.is_empty() {
                    loads.after.push((position, self.decode_sorted(&after)));
                }
            }
            loads.after.reverse();

            if cfg.is_rescue_entry(block) && cfg.global_ensure_block() != Some(block) {
                loads.at_start = self.decode_sorted(&required);
            } else if block == cfg.entry() && self.problem.in_closure {
                loads.at_start = self.closure_entry_loads(tree, &required);
            }

            if !loads.at_start.is_empty() || !loads.after.is_empty() {
                plan.blocks.push(loads);
            }
        }
        Ok(plan)
    }

    /// Locals a closure loads on entry: what is required there, plus what its global
    /// ensure block stores, minus the closure's own locals.
    fn closure_entry_loads(&self, tree: &ScopeTree, required: &BitSet) -> Vec<VarId> {
        let scope = self.problem.scope;
        let own = |var: VarId| {
            matches!(
                tree.variable(var).map(|v| &v.kind),
                Some(VariableKind::ClosureLocal { defining_scope, depth: 0, .. }) if *defining_scope == scope
            )
        };
        let mut vars: BTreeSet<VarId> = self.problem.vars.decode(required).filter(|&v| !own(v)).collect();
        if let Ok(cfg) = tree.cfg(scope) {
            if let Some(ensure) = cfg.global_ensure_block() {
                for instr in cfg.instructions(ensure) {
                    if let Instr::StoreBinding { slot, .. } = instr {
                        if !own(*slot) {
                            vars.insert(*slot);
                        }
                    }
                }
            }
        }
        vars.into_iter().collect()
    }

    /// Inserts the planned loads, then renames the whole scope through `renames`.
    ///
    /// Returns the number of loads inserted.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures.
    pub fn add_loads(&self, tree: &mut ScopeTree, renames: &mut RenameMap) -> Result<usize> {
        let scope = self.problem.scope;
        let plan = self.plan_loads(tree)?;
        for loads in &plan.blocks {
            let old = tree
                .cfg_mut(scope)?
                .replace_instructions(loads.block, Vec::new())
                .ok_or(Error::UnknownBlock(loads.block))?;
            let after: HashMap<usize, &[VarId]> = loads
                .after
                .iter()
                .map(|(p, vars)| (*p, vars.as_slice()))
                .collect();
            let start_at = usize::from(matches!(old.first(), Some(Instr::ReceiveException { .. })));

            let mut new = Vec::with_capacity(old.len() + plan.load_count());
            if start_at == 0 {
                push_loads(&mut new, tree, scope, renames, &loads.at_start);
            }
            for (position, instr) in old.into_iter().enumerate() {
                new.push(instr);
                if let Some(vars) = after.get(&position) {
                    push_loads(&mut new, tree, scope, renames, vars);
                }
                if position + 1 == start_at {
                    push_loads(&mut new, tree, scope, renames, &loads.at_start);
                }
            }
            trace!(%scope, block = %loads.block, "loads placed");
            tree.cfg_mut(scope)?.replace_instructions(loads.block, new);
        }
        renames.apply(tree, scope)?;
        Ok(plan.load_count())
    }
}

fn push_loads(
    new: &mut Vec<Instr>,
    tree: &mut ScopeTree,
    scope: ScopeId,
    renames: &mut RenameMap,
    vars: &[VarId],
) {
    for &var in vars {
        new.push(Instr::LoadBinding {
            dst: renames.temp_for(tree, scope, var),
            slot: var,
        });
    }
}
