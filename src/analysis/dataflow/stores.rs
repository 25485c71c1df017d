//! Store placement: where local variables must be written back to their binding.
//!
//! Locals are kept in temporaries and only spilled to the heap binding when some other
//! code may observe the binding. The analysis is a forward union over the set of *dirty*
//! locals, those whose temporary is newer than the binding cell. A store is placed before
//! every instruction that lets other code see the binding:
//!
//! - a call that passes a real sub-closure stores what that closure reads or writes
//!   (everything when the binding escaped)
//! - any call, when the binding escaped or the callee needs the caller's binding
//! - a global write in an escaped scope, which may trigger trace hooks
//! - a return or break in a closure, for the locals the caller still needs
//! - an instruction that may raise inside a protected block
//!
//! A raise inside an unprotected closure block is caught by a synthesized global ensure
//! block that stores the locals dirty at any such point and re-raises.

use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use crate::{
    analysis::dataflow::{
        framework::{DataFlowProblem, Direction, FlowContext, FlowNode, Solution},
        vars::DataFlowVarIndex,
    },
    ir::{BindingSlot, BlockId, Edge, Instr, ScopeId, ScopeTree, VarId},
    utils::BitSet,
    Result,
};

/// Maps locals to the temporaries that hold their values inside one scope.
///
/// Shared by store and load placement; applying it renames every variable reference of
/// the scope while binding slots keep naming the original local.
#[derive(Debug, Clone, Default)]
pub struct RenameMap {
    temps: HashMap<VarId, VarId>,
}

impl RenameMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the temporary of `var`, minting one in `scope` on first use.
    pub fn temp_for(&mut self, tree: &mut ScopeTree, scope: ScopeId, var: VarId) -> VarId {
        *self
            .temps
            .entry(var)
            .or_insert_with(|| tree.new_temporary(scope))
    }

    /// Returns the temporary of `var`, if one was minted.
    #[must_use]
    pub fn get(&self, var: VarId) -> Option<VarId> {
        self.temps.get(&var).copied()
    }

    /// Number of renamed locals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.temps.len()
    }

    /// Returns `true` if no local was renamed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.temps.is_empty()
    }

    /// Renames every instruction of `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`](crate::Error::UnknownScope) for a foreign scope.
    pub fn apply(&self, tree: &mut ScopeTree, scope: ScopeId) -> Result<()> {
        if self.temps.is_empty() {
            return Ok(());
        }
        let cfg = tree.cfg_mut(scope)?;
        let blocks: Vec<BlockId> = cfg.block_ids().collect();
        for block in blocks {
            if let Some(bb) = cfg.block_mut(block) {
                for instr in &mut bb.instrs {
                    instr.rename_vars(&|v| self.get(v));
                }
            }
        }
        Ok(())
    }
}

/// Stores to insert into one block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockStores {
    /// The block.
    pub block: BlockId,
    /// `(position, locals)`: store `locals` just before instruction `position`.
    pub before: Vec<(usize, Vec<VarId>)>,
    /// Locals stored at the end of the block, ahead of its trailing control transfer.
    pub at_end: Vec<VarId>,
}

/// Output of [`Solution::plan_stores`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorePlan {
    /// Per-block insertions, for blocks with at least one store.
    pub blocks: Vec<BlockStores>,
    /// Locals the global ensure block must store.
    pub ensure: BTreeSet<VarId>,
}

impl StorePlan {
    /// Number of stores inside regular blocks.
    #[must_use]
    pub fn store_count(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.before.iter().map(|(_, v)| v.len()).sum::<usize>() + b.at_end.len())
            .sum()
    }
}

/// Summary of [`Solution::add_stores`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreReport {
    /// Stores inserted, the global ensure block included.
    pub stores: usize,
    /// The global ensure block, if stores were placed into it.
    pub global_ensure: Option<BlockId>,
    /// `true` if the global ensure block was created by this call.
    pub created_global_ensure: bool,
}

/// Store placement bound to one scope.
#[derive(Debug, Clone)]
pub struct StorePlacement {
    scope: ScopeId,
    vars: DataFlowVarIndex,
    in_closure: bool,
    binding_escaped: bool,
    live_on_exit: BTreeSet<VarId>,
    closure_slots: HashMap<ScopeId, BTreeSet<BindingSlot>>,
}

struct StoreStep {
    flush: BitSet,
    ensure: Option<BitSet>,
}

impl StorePlacement {
    /// Name used in logs and errors.
    pub const NAME: &'static str = "store-placement";

    /// Creates the problem for `scope`.
    ///
    /// `live_on_exit` is the liveness "live on scope exit" set of the scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`](crate::Error::UnknownScope) for a foreign scope.
    pub fn new(
        tree: &ScopeTree,
        scope: ScopeId,
        live_on_exit: impl IntoIterator<Item = VarId>,
    ) -> Result<Self> {
        let s = tree.scope(scope)?;
        let mut closure_slots = HashMap::new();
        for &closure in &s.closures {
            let usage = tree.local_usage(closure)?;
            closure_slots.insert(closure, usage.used.union(&usage.defined).cloned().collect());
        }
        let mut problem = Self {
            scope,
            vars: DataFlowVarIndex::new(Self::NAME),
            in_closure: s.is_closure(),
            binding_escaped: s.binding_has_escaped(),
            live_on_exit: live_on_exit
                .into_iter()
                .filter(|&v| tree.vars().is_local(v))
                .collect(),
            closure_slots,
        };
        let seeded: Vec<VarId> = problem.live_on_exit.iter().copied().collect();
        for var in seeded {
            problem.vars.add(var);
        }
        Ok(problem)
    }

    /// The dataflow variable index.
    #[must_use]
    pub fn vars(&self) -> &DataFlowVarIndex {
        &self.vars
    }

    fn live_on_exit_mask(&self) -> BitSet {
        let mut mask = self.vars.empty_set();
        for position in self.live_on_exit.iter().filter_map(|&v| self.vars.get(v)) {
            mask.insert(position);
        }
        mask
    }

    fn closure_touches(&self, tree: &ScopeTree, closure: ScopeId, var: VarId) -> bool {
        match (self.closure_slots.get(&closure), tree.slot(var)) {
            (Some(slots), Some(slot)) => slots.contains(slot),
            // A closure that is not a child of this scope is treated as touching everything
            (None, _) => true,
            (Some(_), None) => false,
        }
    }

    fn step(
        &self,
        cx: &FlowContext<'_, BitSet>,
        block: BlockId,
        instr: &Instr,
        dirty: &mut BitSet,
    ) -> Result<StoreStep> {
        let mut flush = self.vars.empty_set();
        let flush_all = self.binding_escaped || instr.requires_callers_binding();
        if let Some(closure) = instr.sub_closure() {
            if flush_all {
                flush.union_with(dirty);
            } else {
                for position in dirty.iter() {
                    let touched = self
                        .vars
                        .var(position)
                        .is_some_and(|v| self.closure_touches(cx.tree, closure, v));
                    if touched {
                        flush.insert(position);
                    }
                }
            }
        } else if matches!(instr, Instr::Call(_)) && flush_all {
            flush.union_with(dirty);
        }

        if matches!(instr, Instr::PutGlobal { .. }) && self.binding_escaped {
            flush.union_with(dirty);
        }
        dirty.difference_with(&flush);

        if matches!(instr, Instr::Return { .. } | Instr::Break { .. })
            && (self.in_closure || self.binding_escaped)
        {
            if !self.binding_escaped {
                dirty.intersect_with(&self.live_on_exit_mask());
            }
            flush.union_with(dirty);
            dirty.clear();
        }

        let mut ensure = None;
        if instr.can_raise() {
            if cx.cfg.rescuer(block).is_some() {
                flush.union_with(dirty);
                dirty.clear();
            } else if self.in_closure && !dirty.is_empty() {
                ensure = Some(dirty.clone());
            }
        }

        if let Some(dst) = instr.result() {
            if cx.tree.vars().is_local(dst) {
                dirty.insert(self.vars.position(dst)?);
            }
        }
        Ok(StoreStep { flush, ensure })
    }
}

impl DataFlowProblem for StorePlacement {
    type State = BitSet;

    const DIRECTION: Direction = Direction::Forward;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn scope(&self) -> ScopeId {
        self.scope
    }

    fn build_dataflow_vars(&mut self, tree: &ScopeTree, instr: &Instr) {
        for var in instr.result().into_iter().chain(instr.used_variables()) {
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

    fn init_solution(&self, cx: &FlowContext<'_, BitSet>, block: BlockId, state: &mut BitSet) {
        if block == cx.cfg.exit() && !self.binding_escaped {
            state.intersect_with(&self.live_on_exit_mask());
        }
    }

    fn transfer(
        &mut self,
        cx: &FlowContext<'_, BitSet>,
        block: BlockId,
        instr: &Instr,
        state: &mut BitSet,
    ) -> Result<()> {
        self.step(cx, block, instr, state)?;
        Ok(())
    }
}

impl Solution<StorePlacement> {
    fn decode_sorted(&self, set: &BitSet) -> Vec<VarId> {
        let mut vars: Vec<VarId> = self.problem.vars.decode(set).collect();
        vars.sort_unstable();
        vars
    }

    /// Locals dirty on entry to `block`, before the exit-block adjustment.
    #[must_use]
    pub fn dirty_on_entry(&self, block: BlockId) -> Option<BTreeSet<VarId>> {
        self.in_state(block)
            .map(|s| self.problem.vars.decode(s).collect())
    }

    /// Replays every block and lists the stores to insert.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures.
    pub fn plan_stores(&self, tree: &ScopeTree) -> Result<StorePlan> {
        let scope = tree.scope(self.problem.scope)?;
        let cx = FlowContext::new(tree, scope, &self.nodes);
        let mut plan = StorePlan::default();
        let mut ensure = self.problem.vars.empty_set();
        for block in scope.cfg.block_ids() {
            let Some(mut dirty) = self.in_state(block).cloned() else {
                continue;
            };
            self.problem.init_solution(&cx, block, &mut dirty);
            let mut stores = BlockStores {
                block,
                ..BlockStores::default()
            };
            for (position, instr) in scope.cfg.instructions(block).iter().enumerate() {
                let step = self.problem.step(&cx, block, instr, &mut dirty)?;
                if !step.flush.is_empty() {
                    stores.before.push((position, self.decode_sorted(&step.flush)));
                }
                if let Some(pending) = step.ensure {
                    ensure.union_with(&pending);
                }
            }
            if block == scope.cfg.exit() {
                stores.at_end = self.decode_sorted(&dirty);
            }
            if !stores.before.is_empty() || !stores.at_end.is_empty() {
                plan.blocks.push(stores);
            }
        }
        plan.ensure = self.problem.vars.decode(&ensure).collect();
        Ok(plan)
    }

    /// Inserts the planned stores, creating or extending the global ensure block.
    ///
    /// Stored values are read from the temporaries in `renames`.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures.
    pub fn add_stores(&self, tree: &mut ScopeTree, renames: &mut RenameMap) -> Result<StoreReport> {
        let scope = self.problem.scope;
        let plan = self.plan_stores(tree)?;
        let mut report = StoreReport::default();

        for stores in &plan.blocks {
            let old = tree
                .cfg_mut(scope)?
                .replace_instructions(stores.block, Vec::new())
                .ok_or(crate::Error::UnknownBlock(stores.block))?;
            let mut new = Vec::with_capacity(old.len() + stores.at_end.len());
            let mut pending = stores.before.iter().peekable();
            for (position, instr) in old.into_iter().enumerate() {
                if let Some((_, vars)) = pending.next_if(|(p, _)| *p == position) {
                    for &var in vars {
                        new.push(store(tree, scope, renames, var));
                    }
                }
                new.push(instr);
            }
            if !stores.at_end.is_empty() {
                let tail = match new.last() {
                    Some(last) if last.transfers_control() => new.pop(),
                    _ => None,
                };
                for &var in &stores.at_end {
                    new.push(store(tree, scope, renames, var));
                }
                new.extend(tail);
            }
            report.stores += stores.before.iter().map(|(_, v)| v.len()).sum::<usize>();
            report.stores += stores.at_end.len();
            trace!(%scope, block = %stores.block, "stores placed");
            tree.cfg_mut(scope)?.replace_instructions(stores.block, new);
        }

        if self.problem.in_closure && !plan.ensure.is_empty() {
            self.place_ensure_stores(tree, renames, &plan.ensure, &mut report)?;
        }
        Ok(report)
    }

    fn place_ensure_stores(
        &self,
        tree: &mut ScopeTree,
        renames: &mut RenameMap,
        vars: &BTreeSet<VarId>,
        report: &mut StoreReport,
    ) -> Result<()> {
        let scope = self.problem.scope;
        match tree.cfg(scope)?.global_ensure_block() {
            Some(ensure) => {
                let mut instrs = tree.cfg(scope)?.instructions(ensure).to_vec();
                let present: BTreeSet<VarId> = instrs
                    .iter()
                    .filter_map(|i| match i {
                        Instr::StoreBinding { slot, .. } => Some(*slot),
                        _ => None,
                    })
                    .collect();
                let at = usize::from(matches!(instrs.first(), Some(Instr::ReceiveException { .. })));
                let missing: Vec<Instr> = vars
                    .iter()
                    .filter(|v| !present.contains(v))
                    .map(|&v| store(tree, scope, renames, v))
                    .collect();
                report.stores += missing.len();
                instrs.splice(at..at, missing);
                tree.cfg_mut(scope)?.replace_instructions(ensure, instrs);
                report.global_ensure = Some(ensure);
            }
            None => {
                let exception = tree.new_temporary(scope);
                let mut instrs = vec![Instr::ReceiveException { dst: exception }];
                for &var in vars {
                    instrs.push(store(tree, scope, renames, var));
                }
                instrs.push(Instr::Raise {
                    value: exception.into(),
                });
                report.stores += vars.len();
                report.global_ensure = Some(tree.add_global_ensure_block(scope, instrs)?);
                report.created_global_ensure = true;
            }
        }
        Ok(())
    }
}

fn store(tree: &mut ScopeTree, scope: ScopeId, renames: &mut RenameMap, var: VarId) -> Instr {
    Instr::StoreBinding {
        slot: var,
        value: renames.temp_for(tree, scope, var).into(),
    }
}
