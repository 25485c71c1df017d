//! Compilation context for one scope tree.
//!
//! The [`CompilerContext`] holds every result the pass pipeline publishes while it
//! compiles a tree: the liveness solution of each scope, the undefined-variable
//! diagnostics, the rename maps shared by store and load placement, the unboxing memo
//! table, and the event log. Passes read prerequisites from it and fail with
//! [`Error::MissingSolution`] when one was not computed yet.

use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use crate::{
    analysis::{
        DataFlowSolver, LiveOutSets, LiveVariables, RenameMap, Solution, UnboxingCache,
        UndefinedVariables,
    },
    compiler::{config::CompilerConfig, events::EventLog},
    ir::{ScopeId, ScopeTree, VarId},
    Error, Result,
};

/// Published analysis results and change log of one compilation.
pub struct CompilerContext {
    /// Pipeline configuration.
    pub config: CompilerConfig,

    /// Accumulated events from all passes.
    pub events: EventLog,

    /// Closure sub-solutions of the unboxing analysis.
    pub unboxing: UnboxingCache,

    /// Liveness solution per scope.
    liveness: HashMap<ScopeId, Solution<LiveVariables>>,

    /// Reads of possibly unassigned locals, per scope.
    undefined: HashMap<ScopeId, UndefinedVariables>,

    /// Local-to-temporary maps of binding placement, per scope.
    renames: HashMap<ScopeId, RenameMap>,
}

impl CompilerContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new(config: CompilerConfig) -> Self {
        Self {
            config,
            events: EventLog::new(),
            unboxing: UnboxingCache::new(),
            liveness: HashMap::new(),
            undefined: HashMap::new(),
            renames: HashMap::new(),
        }
    }

    /// The liveness solution of `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSolution`] if liveness was not computed for `scope`.
    pub fn liveness(&self, scope: ScopeId) -> Result<&Solution<LiveVariables>> {
        self.liveness.get(&scope).ok_or(Error::MissingSolution {
            analysis: LiveVariables::NAME,
            scope,
        })
    }

    /// Returns `true` if liveness was computed for `scope`.
    #[must_use]
    pub fn has_liveness(&self, scope: ScopeId) -> bool {
        self.liveness.contains_key(&scope)
    }

    /// Computes and publishes liveness for `scopes`, parents before children.
    ///
    /// A root starts with nothing live on exit. A closure's exit set holds the parent's
    /// locals live after any instruction carrying the closure, under the closure's names,
    /// plus the captured locals the closure itself reads on entry: the next invocation
    /// reloads them from the binding.
    ///
    /// # Errors
    ///
    /// Propagates solver errors; with [`CompilerConfig::verify_fixpoints`] a solution that
    /// is not a fixpoint is an [`Error::Internal`].
    pub fn analyze_liveness(&mut self, tree: &ScopeTree, scopes: &[ScopeId]) -> Result<()> {
        for &scope in scopes {
            let mut live_on_exit = self.closure_exit_set(tree, scope)?;
            let in_closure = tree.scope(scope)?.parent.is_some();
            let mut solution = loop {
                let problem = LiveVariables::new(tree, scope, live_on_exit.iter().copied())?;
                let solution = DataFlowSolver::new(problem)
                    .with_visit_limit(self.config.max_visits_per_block)
                    .solve(tree)?;
                if !in_closure {
                    break solution;
                }
                let carried: Vec<VarId> = solution
                    .vars_live_on_scope_entry(tree)?
                    .into_iter()
                    .filter(|&v| is_captured(tree, v) && !live_on_exit.contains(&v))
                    .collect();
                if carried.is_empty() {
                    break solution;
                }
                trace!(%scope, carried = carried.len(), "closure re-reads captured locals");
                live_on_exit.extend(carried);
            };
            if self.config.verify_fixpoints && !solution.is_fixpoint(tree)? {
                return Err(internal_error!(
                    "liveness of {} is not a fixpoint after solving",
                    scope
                ));
            }
            self.liveness.insert(scope, solution);
        }
        Ok(())
    }

    fn closure_exit_set(&self, tree: &ScopeTree, scope: ScopeId) -> Result<BTreeSet<VarId>> {
        let Some(parent) = tree.scope(scope)?.parent else {
            return Ok(BTreeSet::new());
        };
        let parent_live = self.liveness(parent)?;
        let cfg = tree.cfg(parent)?;
        let mut exit = BTreeSet::new();
        for block in cfg.block_ids() {
            for (index, instr) in cfg.instructions(block).iter().enumerate() {
                if instr.sub_closure() != Some(scope) {
                    continue;
                }
                for var in parent_live.live_after(tree, block, index)? {
                    if let Some(inner) = tree.translate_local(var, parent, scope) {
                        exit.insert(inner);
                    }
                }
            }
        }
        Ok(exit)
    }

    /// Live-out sets of `scopes`, for the unboxing rewrite.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSolution`] if a scope lacks liveness.
    pub fn live_out_sets(&self, scopes: &[ScopeId]) -> Result<LiveOutSets> {
        let mut sets = LiveOutSets::new();
        for &scope in scopes {
            sets.insert(scope, self.liveness(scope)?);
        }
        Ok(sets)
    }

    /// Publishes the undefined-variable report of `scope`.
    pub fn set_undefined(&mut self, scope: ScopeId, report: UndefinedVariables) {
        self.undefined.insert(scope, report);
    }

    /// Reads of possibly unassigned locals found in `scope`.
    #[must_use]
    pub fn undefined(&self, scope: ScopeId) -> Option<&UndefinedVariables> {
        self.undefined.get(&scope)
    }

    /// The rename map of `scope`, created on first use.
    pub fn renames_mut(&mut self, scope: ScopeId) -> &mut RenameMap {
        self.renames.entry(scope).or_default()
    }

    /// The rename map of `scope`, if binding placement ran on it.
    #[must_use]
    pub fn renames(&self, scope: ScopeId) -> Option<&RenameMap> {
        self.renames.get(&scope)
    }

    /// Moves the rename map of `scope` out, for passes that also need the tree mutably.
    pub(crate) fn take_renames(&mut self, scope: ScopeId) -> RenameMap {
        self.renames.remove(&scope).unwrap_or_default()
    }

    /// Puts a rename map back.
    pub(crate) fn put_renames(&mut self, scope: ScopeId, renames: RenameMap) {
        self.renames.insert(scope, renames);
    }
}

impl std::fmt::Debug for CompilerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerContext")
            .field("config", &self.config)
            .field("liveness", &self.liveness.len())
            .field("undefined", &self.undefined.len())
            .field("renames", &self.renames.len())
            .field("unboxing", &self.unboxing)
            .finish_non_exhaustive()
    }
}

/// A local owned by an enclosing scope, reached through the binding.
fn is_captured(tree: &ScopeTree, var: VarId) -> bool {
    tree.variable(var)
        .and_then(|v| v.depth())
        .is_some_and(|depth| depth > 0)
}
