//! Unboxing of scalar arithmetic.
//!
//! A forward abstract interpretation infers, per program point, which variables always hold
//! a fixnum, a float or a boolean, which of them currently exist in unboxed (machine scalar)
//! form, and which unboxed copies are *dirty*: newer than the boxed value. A rewrite pass
//! then replaces operator calls on proven scalars by [`Instr::Alu`] and inserts the
//! [`Instr::Unbox`] and [`Instr::Box`] conversions the new code needs.
//!
//! # Barriers
//!
//! An instruction the analysis cannot see into (a call carrying a closure, a call that may
//! inspect the caller's binding, any call once the binding escaped) may read or write any
//! local. Dirty locals are boxed before it and no local stays available unboxed after it.
//! Temporaries are unaffected.
//!
//! # Nested Closures
//!
//! A real sub-closure is analyzed recursively when its carrying instruction is reached. Its
//! entry is seeded with the caller's local types (translated to the closure's own variables)
//! met with the closure's previous exit state, and its exit types are met back into the
//! caller. Unboxed availability never crosses the boundary: the caller cannot know whether the
//! closure ran. Sub-solutions live in an [`UnboxingCache`] owned by the driver, and each
//! closure is rewritten once from its last solution.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut cache = UnboxingCache::new();
//! let report = UnboxableOps::new(&tree, root, &mut cache)?
//!     .solve(&tree)?
//!     .unbox(&mut tree, &live)?;
//! ```

mod ops;
mod state;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, trace};

pub use ops::{alu_op, keeps_fixnum, select_path, unbox_constant};
pub use state::{UnboxState, ValueType};

use crate::{
    analysis::dataflow::{
        framework::{DataFlowProblem, Direction, FlowContext, FlowNode, Solution},
        liveness::LiveVariables,
        solver::{DataFlowSolver, DEFAULT_MAX_VISITS_PER_BLOCK},
    },
    ir::{
        AluOp, BlockId, CallInstr, Cfg, Edge, EdgeKind, Instr, Operand, ScopeId, ScopeTree,
        UnboxedType, VarId, VariableTable,
    },
    Error, Result,
};
use state::BoxedEffects;

/// Per-block live-out sets of every scope the rewrite touches.
///
/// Unboxing only materializes values that are still needed when a block ends.
#[derive(Debug, Clone, Default)]
pub struct LiveOutSets {
    scopes: HashMap<ScopeId, Vec<Option<BTreeSet<VarId>>>>,
}

impl LiveOutSets {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the live-out sets of `scope` from its liveness solution.
    pub fn insert(&mut self, scope: ScopeId, solution: &Solution<LiveVariables>) {
        let sets = (0..solution.block_count())
            .map(|index| solution.live_out(BlockId(index)))
            .collect();
        self.scopes.insert(scope, sets);
    }

    /// Returns `true` if `scope` was recorded.
    #[must_use]
    pub fn contains(&self, scope: ScopeId) -> bool {
        self.scopes.contains_key(&scope)
    }

    /// Live-out set of `block`; `None` if the block was unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSolution`] if `scope` was never recorded.
    pub fn live_out(&self, scope: ScopeId, block: BlockId) -> Result<Option<&BTreeSet<VarId>>> {
        let sets = self.scopes.get(&scope).ok_or(Error::MissingSolution {
            analysis: LiveVariables::NAME,
            scope,
        })?;
        Ok(sets.get(block.index()).and_then(Option::as_ref))
    }
}

#[derive(Debug)]
struct CachedUnboxing {
    nodes: Vec<FlowNode<UnboxState>>,
    exit: UnboxState,
    rewritten: bool,
}

/// Memo table of closure sub-solutions, owned by the driver.
///
/// Clear it before each unboxing run; exit states of a previous run describe code that has
/// since been rewritten.
#[derive(Debug, Default)]
pub struct UnboxingCache {
    entries: HashMap<ScopeId, CachedUnboxing>,
}

impl UnboxingCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached scopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if `scope` was solved.
    #[must_use]
    pub fn contains(&self, scope: ScopeId) -> bool {
        self.entries.contains_key(&scope)
    }

    /// State at the exit of the last solve of `scope`.
    #[must_use]
    pub fn exit_state(&self, scope: ScopeId) -> Option<&UnboxState> {
        self.entries.get(&scope).map(|e| &e.exit)
    }

    /// Returns `true` once the last solution of `scope` was rewritten.
    #[must_use]
    pub fn is_rewritten(&self, scope: ScopeId) -> bool {
        self.entries.get(&scope).is_some_and(|e| e.rewritten)
    }

    /// Forgets every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn store(&mut self, scope: ScopeId, nodes: Vec<FlowNode<UnboxState>>, exit: UnboxState) {
        self.entries.insert(
            scope,
            CachedUnboxing {
                nodes,
                exit,
                rewritten: false,
            },
        );
    }

    fn take_for_rewrite(&mut self, scope: ScopeId) -> Option<Vec<FlowNode<UnboxState>>> {
        let entry = self.entries.get_mut(&scope).filter(|e| !e.rewritten)?;
        entry.rewritten = true;
        Some(std::mem::take(&mut entry.nodes))
    }
}

/// Counts of what the rewrite did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnboxingReport {
    /// Scopes rewritten.
    pub scopes: usize,
    /// Operator calls replaced by [`Instr::Alu`].
    pub operations: usize,
    /// Copies turned into unboxed copies.
    pub copies: usize,
    /// [`Instr::Box`] instructions inserted.
    pub boxes: usize,
    /// [`Instr::Unbox`] instructions inserted.
    pub unboxes: usize,
    /// Branches switched to an unboxed condition.
    pub branches: usize,
}

impl UnboxingReport {
    /// Returns `true` if the IR was left unchanged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations == 0
            && self.copies == 0
            && self.boxes == 0
            && self.unboxes == 0
            && self.branches == 0
    }
}

/// An operand of rewritten code.
#[derive(Debug, Clone, PartialEq)]
enum UnboxedOperand {
    /// The unboxed scratch variable of a variable.
    Scratch(VarId, UnboxedType),
    Const(Operand),
}

/// One entry of a block's rewritten instruction list.
///
/// Every step produces exactly one of `Keep`, `KeepBranch`, `Alu` or `Copy` for the
/// instruction being interpreted, preceded by any conversions it needs.
#[derive(Debug, Clone, PartialEq)]
enum Emitted {
    Keep,
    KeepBranch {
        var: VarId,
        kind: UnboxedType,
    },
    Alu {
        op: AluOp,
        dst: VarId,
        lhs: UnboxedOperand,
        rhs: UnboxedOperand,
    },
    Copy {
        dst: VarId,
        kind: UnboxedType,
        src: UnboxedOperand,
    },
    Box {
        var: VarId,
        kind: UnboxedType,
    },
    Unbox {
        var: VarId,
        kind: UnboxedType,
    },
}

/// Makes `operand` available in `kind`'s unboxed form, emitting the conversions needed.
fn unbox_operand(
    state: &mut UnboxState,
    operand: &Operand,
    kind: UnboxedType,
    out: &mut Vec<Emitted>,
) -> UnboxedOperand {
    let Operand::Var(var) = operand else {
        return UnboxedOperand::Const(unbox_constant(operand, kind));
    };
    match state.unboxed.get(var).copied() {
        Some(current) if current == kind => {}
        current => {
            // A dirty copy in another representation holds the only valid value
            if let Some(current) = current {
                if state.dirty.remove(var) {
                    out.push(Emitted::Box {
                        var: *var,
                        kind: current,
                    });
                }
            }
            out.push(Emitted::Unbox { var: *var, kind });
            state.unboxed.insert(*var, kind);
        }
    }
    UnboxedOperand::Scratch(*var, kind)
}

fn is_scalar_operand(operand: &Operand) -> bool {
    matches!(operand, Operand::Var(_) | Operand::Fixnum(_) | Operand::Float(_))
}

fn alu_candidate<'i>(
    call: &'i CallInstr,
    state: &UnboxState,
) -> Option<(VarId, &'i Operand, UnboxedType, AluOp)> {
    let dst = call.dst?;
    let [arg] = call.args.as_slice() else {
        return None;
    };
    if !is_scalar_operand(&call.receiver) || !is_scalar_operand(arg) {
        return None;
    }
    let (path, op) = select_path(
        &call.method,
        state.operand_type(&call.receiver),
        state.operand_type(arg),
    )?;
    Some((dst, arg, path, op))
}

/// Result type of an operator call that stays boxed.
fn fallback_type(call: &CallInstr, state: &UnboxState) -> ValueType {
    let fixnum = Some(ValueType::Fixnum);
    match call.args.as_slice() {
        [arg]
            if keeps_fixnum(&call.method)
                && state.operand_type(&call.receiver) == fixnum
                && state.operand_type(arg) == fixnum =>
        {
            ValueType::Fixnum
        }
        _ => ValueType::Object,
    }
}

fn exit_state(cfg: &Cfg, nodes: &[FlowNode<UnboxState>]) -> UnboxState {
    nodes
        .get(cfg.exit().index())
        .filter(|n| n.computed)
        .map(|n| n.out_state.clone())
        .unwrap_or_default()
}

/// Unboxable-operations analysis bound to one scope.
#[derive(Debug)]
pub struct UnboxableOps<'c> {
    scope: ScopeId,
    entry_seed: UnboxState,
    in_closure: bool,
    binding_escaped: bool,
    cache: &'c mut UnboxingCache,
    visit_limit: usize,
    replaying: bool,
    sink: Vec<Emitted>,
}

impl<'c> UnboxableOps<'c> {
    /// Name used in logs and errors.
    pub const NAME: &'static str = "unboxable-ops";

    /// Creates the problem for `scope`, storing closure sub-solutions in `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`] for a foreign scope.
    pub fn new(tree: &ScopeTree, scope: ScopeId, cache: &'c mut UnboxingCache) -> Result<Self> {
        let info = tree.scope(scope)?;
        Ok(Self {
            scope,
            entry_seed: UnboxState::default(),
            in_closure: info.is_closure(),
            binding_escaped: info.binding_has_escaped(),
            cache,
            visit_limit: DEFAULT_MAX_VISITS_PER_BLOCK,
            replaying: false,
            sink: Vec::new(),
        })
    }

    /// Overrides the per-block visit bound, for this solve and every closure sub-solve.
    #[must_use]
    pub fn with_visit_limit(mut self, max_visits_per_block: usize) -> Self {
        self.visit_limit = max_visits_per_block;
        self
    }

    /// Solves the problem with its own visit bound.
    ///
    /// # Errors
    ///
    /// Propagates solver errors, including those of closure sub-solves.
    pub fn solve(self, tree: &ScopeTree) -> Result<Solution<Self>> {
        let limit = self.visit_limit;
        DataFlowSolver::new(self).with_visit_limit(limit).solve(tree)
    }

    /// Interprets one instruction, pushing its rewritten form to `out`.
    fn step(
        &mut self,
        tree: &ScopeTree,
        cfg: &Cfg,
        block: BlockId,
        instr: &Instr,
        state: &mut UnboxState,
        out: &mut Vec<Emitted>,
    ) -> Result<()> {
        let dst = instr.result();
        let mut barrier = false;
        match instr {
            Instr::Copy { dst, src } => {
                let ty = state.operand_type(src);
                state.set_type(Some(*dst), ty);
                if let Some(kind) = ty.and_then(ValueType::arithmetic) {
                    let src = unbox_operand(state, src, kind, out);
                    state.define_unboxed(*dst, kind);
                    out.push(Emitted::Copy {
                        dst: *dst,
                        kind,
                        src,
                    });
                    return Ok(());
                }
            }
            Instr::Call(call) if call.closure.is_none() => {
                if let Some((dst, arg, path, op)) = alu_candidate(call, state) {
                    let lhs = unbox_operand(state, &call.receiver, path, out);
                    let rhs = unbox_operand(state, arg, path, out);
                    let result = op.result_type();
                    state.types.insert(dst, ValueType::from(result));
                    state.define_unboxed(dst, result);
                    out.push(Emitted::Alu { op, dst, lhs, rhs });
                    return Ok(());
                }
                state.set_type(dst, Some(fallback_type(call, state)));
                barrier = call.requires_binding || self.binding_escaped;
            }
            Instr::Call(_) | Instr::BuildLambda { .. } => {
                if let Some(closure) = instr.sub_closure() {
                    self.enter_closure(tree, closure, state)?;
                }
                state.set_type(dst, Some(ValueType::Object));
                barrier = true;
            }
            _ => state.set_type(dst, Some(ValueType::Object)),
        }

        let used = instr.used_variables();
        let effects = BoxedEffects {
            dst,
            used: &used,
            may_raise: instr.can_raise(),
            has_rescuer: cfg.rescuer(block).is_some(),
            in_closure: self.in_closure,
            leaves_scope: matches!(instr, Instr::Return { .. } | Instr::Break { .. }),
            barrier,
            reads_unboxed: matches!(instr, Instr::BranchTrue { .. } | Instr::BranchFalse { .. }),
        };
        for (var, kind) in state.settle_boxed(tree.vars(), &effects)? {
            out.push(Emitted::Box { var, kind });
        }

        let unboxed_condition = match instr {
            Instr::BranchTrue { arg: Operand::Var(v), .. }
            | Instr::BranchFalse { arg: Operand::Var(v), .. } => {
                state.unboxed.get(v).map(|&kind| (*v, kind))
            }
            _ => None,
        };
        out.push(match unboxed_condition {
            Some((var, kind)) => Emitted::KeepBranch { var, kind },
            None => Emitted::Keep,
        });
        Ok(())
    }

    /// Solves (or, when replaying, reuses) `closure` and meets its exit types into `state`.
    fn enter_closure(
        &mut self,
        tree: &ScopeTree,
        closure: ScopeId,
        state: &mut UnboxState,
    ) -> Result<()> {
        let scope = self.scope;
        let crosses = |var: VarId, from: ScopeId, to: ScopeId| {
            if tree.vars().is_local(var) {
                tree.translate_local(var, from, to)
            } else {
                None
            }
        };

        if !self.replaying {
            let mut seed = UnboxState::default();
            for (&var, &ty) in &state.types {
                if let Some(inner) = crosses(var, scope, closure) {
                    seed.types.insert(inner, ty);
                }
            }
            if let Some(previous) = self.cache.exit_state(closure) {
                seed.meet_types_where(previous, |v| crosses(v, closure, scope).is_some());
            }

            let problem = UnboxableOps {
                scope: closure,
                entry_seed: seed,
                in_closure: true,
                binding_escaped: tree.scope(closure)?.binding_has_escaped(),
                cache: &mut *self.cache,
                visit_limit: self.visit_limit,
                replaying: false,
                sink: Vec::new(),
            };
            let Solution { nodes, visits, .. } = problem.solve(tree)?;
            let exit = exit_state(tree.cfg(closure)?, &nodes);
            trace!(%closure, visits, exit = ?exit.types, "closure unboxing solved");
            self.cache.store(closure, nodes, exit);
        }

        let Some(exit) = self.cache.exit_state(closure) else {
            return Ok(());
        };
        let mut carried = UnboxState::default();
        for (&var, &ty) in &exit.types {
            if let Some(outer) = crosses(var, closure, scope) {
                carried.types.insert(outer, ty);
            }
        }
        state.meet_types(&carried);
        Ok(())
    }

    /// Interprets `block` from its solved entry state, producing its rewritten list.
    ///
    /// Before the block's control transfer (or at its end) dirty values a successor does not
    /// expect dirty are boxed, and values successors expect unboxed are unboxed.
    fn plan_block(
        &mut self,
        tree: &ScopeTree,
        cfg: &Cfg,
        block: BlockId,
        nodes: &[FlowNode<UnboxState>],
        live_out: Option<&BTreeSet<VarId>>,
    ) -> Result<Vec<Emitted>> {
        let Some(node) = nodes.get(block.index()).filter(|n| n.computed) else {
            return Ok(vec![Emitted::Keep; cfg.instructions(block).len()]);
        };
        let mut state = node.in_state.clone();
        state.normalize();

        let mut successors = Vec::new();
        let mut expected: BTreeMap<VarId, UnboxedType> = BTreeMap::new();
        for edge in cfg.outgoing_edges(block) {
            if edge.kind == EdgeKind::Exception
                || edge.target == cfg.exit()
                || cfg.is_rescue_entry(edge.target)
            {
                continue;
            }
            let Some(succ) = nodes.get(edge.target.index()).filter(|n| n.computed) else {
                continue;
            };
            for (&var, &kind) in &succ.in_state.unboxed {
                expected.entry(var).or_insert(kind);
            }
            successors.push(&succ.in_state);
        }
        let is_live = |var: VarId| live_out.is_some_and(|live| live.contains(&var));
        // A closure falling into its exit hands its locals back through the binding
        let exits_scope = self.in_closure
            && cfg
                .outgoing_edges(block)
                .any(|e| e.kind != EdgeKind::Exception && e.target == cfg.exit());
        let exiting = Exiting {
            successors: &successors,
            expected: &expected,
            flush_locals: exits_scope.then(|| tree.vars()),
        };

        let mut out = Vec::new();
        let mut left = false;
        for instr in cfg.instructions(block) {
            if instr.transfers_control() && !left {
                leave_block(&mut state, &exiting, is_live, &mut out)?;
                left = true;
            }
            self.step(tree, cfg, block, instr, &mut state, &mut out)?;
        }
        if !left {
            leave_block(&mut state, &exiting, is_live, &mut out)?;
        }
        Ok(out)
    }
}

/// What a block hands to the blocks (or the scope exit) it leaves to.
struct Exiting<'a> {
    successors: &'a [&'a UnboxState],
    expected: &'a BTreeMap<VarId, UnboxedType>,
    /// Set when the block leaves a closure: every dirty local is boxed.
    flush_locals: Option<&'a VariableTable>,
}

fn leave_block(
    state: &mut UnboxState,
    exiting: &Exiting<'_>,
    is_live: impl Fn(VarId) -> bool,
    out: &mut Vec<Emitted>,
) -> Result<()> {
    let stale: Vec<VarId> = state
        .dirty
        .iter()
        .copied()
        .filter(|&v| {
            exiting.flush_locals.is_some_and(|vars| vars.is_local(v))
                || (is_live(v) && exiting.successors.iter().any(|s| !s.is_dirty_unboxed(v)))
        })
        .collect();
    for var in stale {
        let kind = state
            .unboxed
            .get(&var)
            .copied()
            .ok_or(Error::MissingUnboxedVar(var))?;
        state.dirty.remove(&var);
        out.push(Emitted::Box { var, kind });
    }

    for (&var, &kind) in exiting.expected {
        if !state.unboxed.contains_key(&var) && is_live(var) {
            out.push(Emitted::Unbox { var, kind });
            state.unboxed.insert(var, kind);
        }
    }
    Ok(())
}

impl DataFlowProblem for UnboxableOps<'_> {
    type State = UnboxState;

    const DIRECTION: Direction = Direction::Forward;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn scope(&self) -> ScopeId {
        self.scope
    }

    fn initial_state(&self, _cx: &FlowContext<'_, UnboxState>, _block: BlockId) -> UnboxState {
        UnboxState::default()
    }

    fn pre_meet(&self, cx: &FlowContext<'_, UnboxState>, block: BlockId) -> UnboxState {
        if self.in_closure && block == cx.cfg.entry() {
            self.entry_seed.clone()
        } else {
            UnboxState::default()
        }
    }

    fn meet(
        &self,
        cx: &FlowContext<'_, UnboxState>,
        edge: &Edge,
        neighbor: &FlowNode<UnboxState>,
        acc: &mut UnboxState,
    ) {
        // Handlers start boxed; raising instructions box everything first
        if !cx.cfg.is_rescue_entry(edge.target) {
            acc.meet(&neighbor.out_state);
        }
    }

    fn init_solution(
        &self,
        _cx: &FlowContext<'_, UnboxState>,
        _block: BlockId,
        state: &mut UnboxState,
    ) {
        state.normalize();
    }

    fn transfer(
        &mut self,
        cx: &FlowContext<'_, UnboxState>,
        block: BlockId,
        instr: &Instr,
        state: &mut UnboxState,
    ) -> Result<()> {
        let mut sink = std::mem::take(&mut self.sink);
        let result = self.step(cx.tree, cx.cfg, block, instr, state, &mut sink);
        sink.clear();
        self.sink = sink;
        result
    }
}

/// Unboxed scratch variables minted during one scope's rewrite.
#[derive(Default)]
struct ScratchVars {
    vars: HashMap<(VarId, UnboxedType), VarId>,
}

impl ScratchVars {
    fn get(&mut self, tree: &mut ScopeTree, scope: ScopeId, var: VarId, kind: UnboxedType) -> VarId {
        *self
            .vars
            .entry((var, kind))
            .or_insert_with(|| tree.new_unboxed_temporary(scope, kind))
    }

    fn operand(
        &mut self,
        tree: &mut ScopeTree,
        scope: ScopeId,
        operand: UnboxedOperand,
    ) -> Operand {
        match operand {
            UnboxedOperand::Scratch(var, kind) => Operand::Var(self.get(tree, scope, var, kind)),
            UnboxedOperand::Const(c) => c,
        }
    }
}

fn rewrite_scope(
    tree: &mut ScopeTree,
    scope: ScopeId,
    nodes: &[FlowNode<UnboxState>],
    live: &LiveOutSets,
    cache: &mut UnboxingCache,
    report: &mut UnboxingReport,
) -> Result<()> {
    let plan = {
        let view: &ScopeTree = tree;
        let cfg = view.cfg(scope)?;
        let mut replay = UnboxableOps::new(view, scope, cache)?;
        replay.replaying = true;
        let mut plan = Vec::new();
        for block in cfg.block_ids() {
            if !nodes.get(block.index()).is_some_and(FlowNode::is_computed) {
                continue;
            }
            let emitted = replay.plan_block(view, cfg, block, nodes, live.live_out(scope, block)?)?;
            if emitted.iter().any(|e| *e != Emitted::Keep) {
                plan.push((block, emitted));
            }
        }
        plan
    };

    let mut scratch = ScratchVars::default();
    for (block, emitted) in plan {
        let old = tree
            .cfg_mut(scope)?
            .replace_instructions(block, Vec::new())
            .ok_or(Error::UnknownBlock(block))?;
        let mut originals = old.into_iter();
        let mut next_original = || {
            originals
                .next()
                .ok_or_else(|| internal_error!("unboxing plan of {} outruns its instructions", block))
        };
        let mut rewritten = Vec::with_capacity(emitted.len());
        for item in emitted {
            let instr = match item {
                Emitted::Keep => next_original()?,
                Emitted::KeepBranch { var, kind } => {
                    let mut instr = next_original()?;
                    let unboxed = scratch.get(tree, scope, var, kind);
                    if let Instr::BranchTrue { arg, .. } | Instr::BranchFalse { arg, .. } = &mut instr {
                        *arg = Operand::Var(unboxed);
                    }
                    report.branches += 1;
                    instr
                }
                Emitted::Alu { op, dst, lhs, rhs } => {
                    next_original()?;
                    report.operations += 1;
                    Instr::Alu {
                        op,
                        dst: scratch.get(tree, scope, dst, op.result_type()),
                        lhs: scratch.operand(tree, scope, lhs),
                        rhs: scratch.operand(tree, scope, rhs),
                    }
                }
                Emitted::Copy { dst, kind, src } => {
                    next_original()?;
                    report.copies += 1;
                    Instr::Copy {
                        dst: scratch.get(tree, scope, dst, kind),
                        src: scratch.operand(tree, scope, src),
                    }
                }
                Emitted::Box { var, kind } => {
                    report.boxes += 1;
                    Instr::Box {
                        kind,
                        dst: var,
                        src: Operand::Var(scratch.get(tree, scope, var, kind)),
                    }
                }
                Emitted::Unbox { var, kind } => {
                    report.unboxes += 1;
                    Instr::Unbox {
                        kind,
                        dst: scratch.get(tree, scope, var, kind),
                        src: Operand::Var(var),
                    }
                }
            };
            trace!(%scope, %block, %instr, "unboxing");
            rewritten.push(instr);
        }
        rewritten.extend(originals);
        tree.cfg_mut(scope)?.replace_instructions(block, rewritten);
    }
    Ok(())
}

impl Solution<UnboxableOps<'_>> {
    /// Known type of `var` on entry to `block`.
    #[must_use]
    pub fn type_on_entry(&self, block: BlockId, var: VarId) -> Option<ValueType> {
        self.in_state(block)?.types.get(&var).copied()
    }

    /// Variables available unboxed at the end of `block`.
    #[must_use]
    pub fn unboxed_on_exit(&self, block: BlockId) -> Option<&BTreeMap<VarId, UnboxedType>> {
        self.out_state(block).map(|s| &s.unboxed)
    }

    /// Rewrites the solved scope and every closure solved along with it.
    ///
    /// Each scope is rewritten once, from its last solution, in tree preorder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSolution`] if `live` lacks a rewritten scope, or
    /// [`Error::MissingUnboxedVar`] if a dirty value has no known representation.
    pub fn unbox(self, tree: &mut ScopeTree, live: &LiveOutSets) -> Result<UnboxingReport> {
        let Solution { problem, nodes, .. } = self;
        let UnboxableOps { scope, cache, .. } = problem;
        let exit = exit_state(tree.cfg(scope)?, &nodes);
        cache.store(scope, nodes, exit);

        let mut report = UnboxingReport::default();
        for id in tree.preorder(scope)? {
            let Some(nodes) = cache.take_for_rewrite(id) else {
                continue;
            };
            rewrite_scope(tree, id, &nodes, live, cache, &mut report)?;
            report.scopes += 1;
        }
        debug!(
            %scope,
            scopes = report.scopes,
            operations = report.operations,
            boxes = report.boxes,
            unboxes = report.unboxes,
            "unboxing applied"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::UnboxedType,
        test::{instructions, link_chain},
    };

    fn live_sets(tree: &ScopeTree, scopes: &[ScopeId]) -> Result<LiveOutSets> {
        let mut live = LiveOutSets::new();
        for &scope in scopes {
            let problem = LiveVariables::new(tree, scope, std::iter::empty())?;
            live.insert(scope, &DataFlowSolver::new(problem).solve(tree)?);
        }
        Ok(live)
    }

    fn unbox(tree: &mut ScopeTree, root: ScopeId, scopes: &[ScopeId]) -> Result<UnboxingReport> {
        let live = live_sets(tree, scopes)?;
        let mut cache = UnboxingCache::new();
        UnboxableOps::new(tree, root, &mut cache)?
            .solve(tree)?
            .unbox(tree, &live)
    }

    fn boxes_into(instrs: &[Instr], var: VarId) -> usize {
        instrs
            .iter()
            .filter(|i| matches!(i, Instr::Box { dst, .. } if *dst == var))
            .count()
    }

    #[test]
    fn test_float_add_runs_unboxed() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let a = tree.local(m, "a", 0)?;
        let b = tree.local(m, "b", 0)?;
        let c = tree.local(m, "c", 0)?;
        let d = tree.local(m, "d", 0)?;
        let blk = tree.block_var(m);
        let [b1] = link_chain(tree.cfg_mut(m)?, ["b1"]);
        let cfg = tree.cfg_mut(m)?;
        cfg.push(b1, Instr::copy(a, Operand::Float(1.5)));
        cfg.push(b1, Instr::copy(b, Operand::Float(2.5)));
        // Passing a block forces a and b back into boxed form
        cfg.push(
            b1,
            Instr::Call(CallInstr::new(None, Operand::Nil, "each", vec![]).with_closure(blk.into())),
        );
        cfg.push(b1, Instr::call(Some(c), a, "+", vec![b.into()]));
        cfg.push(b1, Instr::call(Some(d), c, "*", vec![Operand::Float(2.0)]));
        cfg.push(b1, Instr::Return { value: d.into() });

        let report = unbox(&mut tree, m, &[m])?;
        let instrs = instructions(&tree, m);
        let alus: Vec<&Instr> = instrs.iter().filter(|i| matches!(i, Instr::Alu { .. })).collect();
        assert_eq!(alus.len(), 2);
        assert!(matches!(alus[0], Instr::Alu { op: AluOp::FAdd, .. }));
        assert!(matches!(
            alus[1],
            Instr::Alu { op: AluOp::FMul, rhs: Operand::UnboxedFloat(x), .. } if *x == 2.0
        ));
        assert_eq!(report.operations, 2);
        assert_eq!(report.unboxes, 2);
        assert_eq!(boxes_into(&instrs, c), 0);
        assert_eq!(boxes_into(&instrs, a), 1);
        assert_eq!(boxes_into(&instrs, d), 1);
        assert!(matches!(instrs.last(), Some(Instr::Return { value }) if *value == Operand::Var(d)));
        Ok(())
    }

    #[test]
    fn test_second_run_is_a_noop() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let x = tree.local(m, "x", 0)?;
        let y = tree.local(m, "y", 0)?;
        let [b1, b2] = link_chain(tree.cfg_mut(m)?, ["b1", "b2"]);
        let cfg = tree.cfg_mut(m)?;
        cfg.push(b1, Instr::copy(x, Operand::Fixnum(3)));
        cfg.push(b2, Instr::call(Some(y), x, "<<", vec![Operand::Fixnum(2)]));
        cfg.push(b2, Instr::call(None, Operand::Nil, "p", vec![y.into()]));

        let first = unbox(&mut tree, m, &[m])?;
        assert_eq!(first.operations, 1);
        let after_first = instructions(&tree, m);

        let second = unbox(&mut tree, m, &[m])?;
        assert!(second.is_empty(), "{second:?}");
        assert_eq!(instructions(&tree, m), after_first);
        Ok(())
    }

    #[test]
    fn test_bitwise_op_on_float_stays_a_call() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let f = tree.local(m, "f", 0)?;
        let g = tree.local(m, "g", 0)?;
        let [b1] = link_chain(tree.cfg_mut(m)?, ["b1"]);
        let cfg = tree.cfg_mut(m)?;
        cfg.push(b1, Instr::copy(f, Operand::Float(1.5)));
        cfg.push(b1, Instr::call(Some(g), f, "|", vec![Operand::Fixnum(1)]));
        cfg.push(b1, Instr::Return { value: g.into() });

        let report = unbox(&mut tree, m, &[m])?;
        assert_eq!(report.operations, 0);
        let instrs = instructions(&tree, m);
        assert!(matches!(instrs[1], Instr::Box { kind: UnboxedType::Float, dst, .. } if dst == f));
        assert!(matches!(&instrs[2], Instr::Call(call) if call.method == "|"));
        Ok(())
    }

    #[test]
    fn test_fixnum_remainder_feeds_unboxed_add() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let a = tree.local(m, "a", 0)?;
        let b = tree.local(m, "b", 0)?;
        let c = tree.local(m, "c", 0)?;
        let [b1] = link_chain(tree.cfg_mut(m)?, ["b1"]);
        let cfg = tree.cfg_mut(m)?;
        cfg.push(b1, Instr::copy(a, Operand::Fixnum(7)));
        cfg.push(b1, Instr::call(Some(b), a, "%", vec![Operand::Fixnum(4)]));
        cfg.push(b1, Instr::call(Some(c), b, "+", vec![Operand::Fixnum(1)]));
        cfg.push(b1, Instr::Return { value: c.into() });

        let mut cache = UnboxingCache::new();
        let solution = UnboxableOps::new(&tree, m, &mut cache)?.solve(&tree)?;
        let exit = tree.cfg(m)?.exit();
        assert_eq!(solution.type_on_entry(exit, b), Some(ValueType::Fixnum));
        assert_eq!(solution.type_on_entry(exit, c), Some(ValueType::Fixnum));

        let live = live_sets(&tree, &[m])?;
        let report = solution.unbox(&mut tree, &live)?;
        assert_eq!(report.operations, 1);
        let instrs = instructions(&tree, m);
        assert!(instrs.iter().any(|i| matches!(i, Instr::Call(call) if call.method == "%")));
        assert!(instrs.iter().any(|i| matches!(i, Instr::Alu { op: AluOp::IAdd, .. })));
        Ok(())
    }

    #[test]
    fn test_branch_reads_unboxed_condition() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let a = tree.local(m, "a", 0)?;
        let lt = tree.new_temporary(m);
        let [b1, b2] = link_chain(tree.cfg_mut(m)?, ["b1", "b2"]);
        let cfg = tree.cfg_mut(m)?;
        cfg.push(b1, Instr::copy(a, Operand::Float(1.5)));
        cfg.push(b1, Instr::call(Some(lt), a, "<", vec![Operand::Float(2.5)]));
        cfg.push(b1, Instr::BranchTrue { arg: lt.into(), target: b2 });
        cfg.add_edge(b1, b2, EdgeKind::Regular);
        cfg.push(b2, Instr::Return { value: Operand::Nil });

        let report = unbox(&mut tree, m, &[m])?;
        assert_eq!(report.branches, 1);
        let instrs = tree.cfg(m)?.instructions(b1).to_vec();
        let Some(Instr::BranchTrue { arg: Operand::Var(cond), .. }) = instrs.last() else {
            panic!("expected a branch, got {instrs:?}");
        };
        assert_eq!(
            tree.variable(*cond).and_then(|v| v.unboxed_type()),
            Some(UnboxedType::Boolean)
        );
        assert!(matches!(instrs[1], Instr::Alu { op: AluOp::FLt, dst, .. } if dst == *cond));
        Ok(())
    }

    #[test]
    fn test_disagreeing_paths_box_before_join() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let c = tree.local(m, "c", 0)?;
        let x = tree.local(m, "x", 0)?;
        let [head, left, join] = link_chain(tree.cfg_mut(m)?, ["head", "left", "join"]);
        let cfg = tree.cfg_mut(m)?;
        let right = cfg.add_block("right");
        cfg.add_edge(head, right, EdgeKind::Regular);
        cfg.add_edge(right, join, EdgeKind::Regular);
        cfg.push(head, Instr::ReceiveArg { dst: c, index: 0 });
        cfg.push(head, Instr::BranchFalse { arg: c.into(), target: right });
        cfg.push(left, Instr::copy(x, Operand::Fixnum(1)));
        cfg.push(right, Instr::copy(x, Operand::Float(1.5)));
        cfg.push(right, Instr::Jump { target: join });
        cfg.push(join, Instr::call(None, Operand::Nil, "p", vec![x.into()]));
        cfg.push(join, Instr::Return { value: Operand::Nil });

        unbox(&mut tree, m, &[m])?;
        let cfg = tree.cfg(m)?;
        assert!(matches!(
            cfg.instructions(left),
            [Instr::Copy { src: Operand::UnboxedFixnum(1), .. }, Instr::Box { kind: UnboxedType::Fixnum, dst, .. }]
                if *dst == x
        ));
        assert!(matches!(
            cfg.instructions(right),
            [Instr::Copy { .. }, Instr::Box { kind: UnboxedType::Float, dst, .. }, Instr::Jump { .. }]
                if *dst == x
        ));
        assert!(!cfg.instructions(join).iter().any(|i| matches!(i, Instr::Box { .. })));
        Ok(())
    }

    #[test]
    fn test_closure_is_solved_and_rewritten_once() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let blk = tree.add_closure(m, "blk")?;
        let sum = tree.local(m, "sum", 0)?;
        let inner = tree.local(blk, "sum", 1)?;
        let [b1] = link_chain(tree.cfg_mut(m)?, ["b1"]);
        let cfg = tree.cfg_mut(m)?;
        cfg.push(b1, Instr::copy(sum, Operand::Float(0.0)));
        cfg.push(
            b1,
            Instr::Call(
                CallInstr::new(None, Operand::Nil, "each", vec![]).with_closure(Operand::Closure(blk)),
            ),
        );
        cfg.push(b1, Instr::Return { value: sum.into() });
        let [c1] = link_chain(tree.cfg_mut(blk)?, ["c1"]);
        let ccfg = tree.cfg_mut(blk)?;
        ccfg.push(c1, Instr::call(Some(inner), inner, "+", vec![Operand::Float(1.0)]));
        ccfg.push(c1, Instr::Return { value: Operand::Nil });

        let live = live_sets(&tree, &[m, blk])?;
        let mut cache = UnboxingCache::new();
        let solution = UnboxableOps::new(&tree, m, &mut cache)?.solve(&tree)?;
        assert_eq!(solution.type_on_entry(tree.cfg(m)?.exit(), sum), Some(ValueType::Float));
        let report = solution.unbox(&mut tree, &live)?;
        assert_eq!(report.scopes, 2);
        assert!(cache.is_rewritten(blk));
        assert_eq!(
            cache.exit_state(blk).and_then(|s| s.types.get(&inner).copied()),
            Some(ValueType::Float)
        );

        // The parent flushes sum before the block runs
        let parent = instructions(&tree, m);
        assert!(matches!(parent[1], Instr::Box { dst, .. } if dst == sum));
        assert!(matches!(parent[2], Instr::Call(_)));

        // The closure unboxes its captured sum, adds, and boxes before returning
        let body = instructions(&tree, blk);
        assert!(matches!(body[0], Instr::Unbox { kind: UnboxedType::Float, src: Operand::Var(v), .. } if v == inner));
        assert!(matches!(body[1], Instr::Alu { op: AluOp::FAdd, .. }));
        assert!(matches!(body[2], Instr::Box { dst, .. } if dst == inner));
        assert!(matches!(body[3], Instr::Return { .. }));
        Ok(())
    }

    #[test]
    fn test_closure_falling_into_exit_boxes_captured_locals() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let blk = tree.add_closure(m, "blk")?;
        let sum = tree.local(m, "sum", 0)?;
        let inner = tree.local(blk, "sum", 1)?;
        let [b1] = link_chain(tree.cfg_mut(m)?, ["b1"]);
        let cfg = tree.cfg_mut(m)?;
        cfg.push(b1, Instr::copy(sum, Operand::Float(0.0)));
        cfg.push(
            b1,
            Instr::Call(
                CallInstr::new(None, Operand::Nil, "each", vec![]).with_closure(Operand::Closure(blk)),
            ),
        );
        cfg.push(b1, Instr::Return { value: sum.into() });
        let [c1] = link_chain(tree.cfg_mut(blk)?, ["c1"]);
        tree.cfg_mut(blk)?
            .push(c1, Instr::call(Some(inner), inner, "+", vec![Operand::Float(1.0)]));

        let report = unbox(&mut tree, m, &[m, blk])?;
        assert_eq!(report.operations, 1);
        assert_eq!(boxes_into(&instructions(&tree, blk), inner), 1);
        let body = tree.cfg(blk)?.instructions(c1);
        assert!(matches!(body.last(), Some(Instr::Box { dst, .. }) if *dst == inner));
        assert!(body.iter().any(|i| matches!(i, Instr::Alu { op: AluOp::FAdd, .. })));
        Ok(())
    }

    #[test]
    fn test_missing_liveness_is_reported() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let x = tree.local(m, "x", 0)?;
        let [b1] = link_chain(tree.cfg_mut(m)?, ["b1"]);
        tree.cfg_mut(m)?.push(b1, Instr::copy(x, Operand::Float(1.0)));

        let mut cache = UnboxingCache::new();
        let result = UnboxableOps::new(&tree, m, &mut cache)?
            .solve(&tree)?
            .unbox(&mut tree, &LiveOutSets::new());
        assert!(matches!(result, Err(Error::MissingSolution { analysis: "live-variables", .. })));
        Ok(())
    }
}
