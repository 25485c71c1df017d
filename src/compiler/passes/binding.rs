//! Binding placement pass.
//!
//! Locals captured by closures live in a heap binding. This pass keeps them in
//! temporaries and places the binding stores ([`StorePlacement`]) and loads
//! ([`LoadPlacement`]) needed wherever other code may observe the binding. Both analyses
//! of a scope share one [`RenameMap`](crate::analysis::RenameMap), so the temporary a store
//! reads is the one the loads write.
//!
//! # Example
//!
//! Before:
//! ```text
//! sum = 0
//! each { sum = sum + 1 }
//! return sum
//! ```
//!
//! After (parent):
//! ```text
//! t0 = 0
//! store sum <- t0
//! each { ... }
//! t0 = load sum
//! return t0
//! ```

use tracing::debug;

use crate::{
    analysis::{DataFlowSolver, LoadPlacement, StorePlacement},
    compiler::{pass::ScopePass, CompilerContext, EventKind},
    ir::{BlockId, Instr, ScopeId, ScopeTree},
    Result,
};

/// Places closure-binding stores and loads, parents before children.
#[derive(Debug, Default)]
pub struct BindingPlacementPass;

impl BindingPlacementPass {
    /// Creates a new binding placement pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Number of binding stores and loads in each block.
fn binding_traffic(tree: &ScopeTree, scope: ScopeId) -> Result<Vec<(usize, usize)>> {
    let cfg = tree.cfg(scope)?;
    Ok(cfg
        .block_ids()
        .map(|block| {
            cfg.instructions(block)
                .iter()
                .fold((0, 0), |(stores, loads), instr| match instr {
                    Instr::StoreBinding { .. } => (stores + 1, loads),
                    Instr::LoadBinding { .. } => (stores, loads + 1),
                    _ => (stores, loads),
                })
        })
        .collect())
}

fn record_binding_traffic(
    ctx: &CompilerContext,
    scope: ScopeId,
    before: &[(usize, usize)],
    after: &[(usize, usize)],
) {
    for (index, &(stores, loads)) in after.iter().enumerate() {
        let (old_stores, old_loads) = before.get(index).copied().unwrap_or_default();
        let block = BlockId(index);
        for _ in old_stores..stores {
            ctx.events.record(EventKind::StoreInserted).at(scope, block);
        }
        for _ in old_loads..loads {
            ctx.events.record(EventKind::LoadInserted).at(scope, block);
        }
    }
}

impl ScopePass for BindingPlacementPass {
    fn name(&self) -> &'static str {
        "binding-placement"
    }

    fn description(&self) -> &'static str {
        "Spills captured locals to their closure binding and reloads them"
    }

    fn should_run(&self, tree: &ScopeTree, scope: ScopeId, _ctx: &CompilerContext) -> bool {
        tree.scope(scope)
            .is_ok_and(|s| s.is_closure() || !s.closures.is_empty() || s.binding_has_escaped())
    }

    fn run_on_scope(
        &self,
        tree: &mut ScopeTree,
        scope: ScopeId,
        ctx: &mut CompilerContext,
    ) -> Result<bool> {
        let limit = ctx.config.max_visits_per_block;
        let live_on_exit = ctx.liveness(scope)?.vars_live_on_scope_exit().clone();
        let before = binding_traffic(tree, scope)?;

        let mut renames = ctx.take_renames(scope);
        let stores = DataFlowSolver::new(StorePlacement::new(tree, scope, live_on_exit)?)
            .with_visit_limit(limit)
            .solve(tree)?
            .add_stores(tree, &mut renames)?;
        let loads = DataFlowSolver::new(LoadPlacement::new(tree, scope)?)
            .with_visit_limit(limit)
            .solve(tree)?
            .add_loads(tree, &mut renames)?;
        let renamed = !renames.is_empty();
        ctx.put_renames(scope, renames);

        if let Some(ensure) = stores.global_ensure.filter(|_| stores.created_global_ensure) {
            ctx.events
                .record(EventKind::GlobalEnsureAdded)
                .at(scope, ensure);
        }
        record_binding_traffic(ctx, scope, &before, &binding_traffic(tree, scope)?);
        debug!(%scope, stores = stores.stores, loads, "binding placement done");
        Ok(stores.stores > 0 || loads > 0 || renamed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::CompilerConfig,
        ir::{CallInstr, Operand},
        test::{instructions, link_chain},
    };

    #[test]
    fn test_plain_method_is_skipped() {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let ctx = CompilerContext::new(CompilerConfig::default());
        assert!(!BindingPlacementPass::new().should_run(&tree, m, &ctx));
        let blk = tree.add_closure(m, "blk");
        assert!(blk.is_ok());
        assert!(BindingPlacementPass::new().should_run(&tree, m, &ctx));
    }

    #[test]
    fn test_parent_stores_before_the_block_and_reloads_after() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let blk = tree.add_closure(m, "blk")?;
        let sum = tree.local(m, "sum", 0)?;
        let inner = tree.local(blk, "sum", 1)?;
        let [b1] = link_chain(tree.cfg_mut(m)?, ["b1"]);
        let cfg = tree.cfg_mut(m)?;
        cfg.push(b1, Instr::copy(sum, Operand::Fixnum(0)));
        cfg.push(
            b1,
            Instr::Call(
                CallInstr::new(None, Operand::Nil, "each", vec![]).with_closure(Operand::Closure(blk)),
            ),
        );
        cfg.push(b1, Instr::Return { value: sum.into() });
        let [c1] = link_chain(tree.cfg_mut(blk)?, ["c1"]);
        let ccfg = tree.cfg_mut(blk)?;
        ccfg.push(c1, Instr::call(Some(inner), inner, "+", vec![Operand::Fixnum(1)]));
        ccfg.push(c1, Instr::Return { value: Operand::Nil });

        let mut ctx = CompilerContext::new(CompilerConfig::default());
        ctx.analyze_liveness(&tree, &[m, blk])?;
        let pass = BindingPlacementPass::new();
        assert!(pass.run_on_scope(&mut tree, m, &mut ctx)?);

        let parent = instructions(&tree, m);
        let call = parent
            .iter()
            .position(|i| matches!(i, Instr::Call(_)))
            .expect("the call survives");
        assert!(matches!(parent[call - 1], Instr::StoreBinding { slot, .. } if slot == sum));
        assert!(matches!(parent[call + 1], Instr::LoadBinding { slot, .. } if slot == sum));
        assert_eq!(ctx.events.count(EventKind::StoreInserted), 1);
        assert_eq!(ctx.events.count(EventKind::LoadInserted), 1);
        assert!(ctx.renames(m).is_some_and(|r| r.get(sum).is_some()));
        Ok(())
    }
}
