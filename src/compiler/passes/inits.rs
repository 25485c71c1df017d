//! Missing initialization pass.
//!
//! A local read on some path before any assignment evaluates to `nil`. The pass finds the
//! locals that are both possibly undefined at a read ([`DefinedVariables`]) and live on
//! entry to the scope ([`LiveVariables`]), and assigns `nil` to each of them at the top of
//! the entry block. The reads themselves are published as diagnostics.
//!
//! [`LiveVariables`]: crate::analysis::LiveVariables

use tracing::debug;

use crate::{
    analysis::{DataFlowSolver, DefinedVariables},
    compiler::{pass::ScopePass, CompilerContext, EventKind},
    ir::{Instr, Operand, ScopeId, ScopeTree},
    Error, Result,
};

/// Inserts `v = nil` for locals that may be read unassigned.
#[derive(Debug, Default)]
pub struct MissingInitsPass;

impl MissingInitsPass {
    /// Creates a new missing initialization pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ScopePass for MissingInitsPass {
    fn name(&self) -> &'static str {
        "missing-inits"
    }

    fn description(&self) -> &'static str {
        "Initializes locals that may be read before assignment to nil"
    }

    fn run_on_scope(
        &self,
        tree: &mut ScopeTree,
        scope: ScopeId,
        ctx: &mut CompilerContext,
    ) -> Result<bool> {
        let undefined = DataFlowSolver::new(DefinedVariables::new(scope))
            .with_visit_limit(ctx.config.max_visits_per_block)
            .solve(tree)?
            .identify_inits(tree)?;
        for use_site in &undefined.uses {
            ctx.events
                .record(EventKind::UndefinedVariable)
                .at(scope, use_site.block)
                .message(format!("{} read at {}", use_site.var, use_site.index));
        }

        let live_on_entry = ctx.liveness(scope)?.vars_live_on_scope_entry(tree)?;
        let inits: Vec<Instr> = undefined
            .vars
            .iter()
            .copied()
            .filter(|v| tree.vars().is_local(*v) && live_on_entry.contains(v))
            .map(|v| Instr::copy(v, Operand::Nil))
            .collect();
        ctx.set_undefined(scope, undefined);
        if inits.is_empty() {
            return Ok(false);
        }

        let entry = tree.cfg(scope)?.entry();
        let cfg = tree.cfg_mut(scope)?;
        let old = cfg
            .replace_instructions(entry, Vec::new())
            .ok_or(Error::UnknownBlock(entry))?;
        for init in &inits {
            ctx.events
                .record(EventKind::InitInserted)
                .at(scope, entry)
                .message(init.to_string());
        }
        debug!(%scope, inits = inits.len(), "missing initializations inserted");
        let mut new = inits;
        new.extend(old);
        cfg.replace_instructions(entry, new);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::CompilerConfig,
        ir::EdgeKind,
        test::link_chain,
    };

    #[test]
    fn test_conditionally_assigned_local_gets_nil() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let c = tree.local(m, "c", 0)?;
        let x = tree.local(m, "x", 0)?;
        let [head, assign, join] = link_chain(tree.cfg_mut(m)?, ["head", "assign", "join"]);
        let cfg = tree.cfg_mut(m)?;
        cfg.add_edge(head, join, EdgeKind::Regular);
        cfg.push(head, Instr::ReceiveArg { dst: c, index: 0 });
        cfg.push(head, Instr::BranchFalse { arg: c.into(), target: join });
        cfg.push(assign, Instr::copy(x, Operand::Fixnum(1)));
        cfg.push(join, Instr::Return { value: x.into() });

        let mut ctx = CompilerContext::new(CompilerConfig::default());
        ctx.analyze_liveness(&tree, &[m])?;
        assert!(MissingInitsPass::new().run_on_scope(&mut tree, m, &mut ctx)?);

        let cfg = tree.cfg(m)?;
        assert_eq!(cfg.instructions(cfg.entry()), &[Instr::copy(x, Operand::Nil)]);
        assert_eq!(ctx.events.count(EventKind::InitInserted), 1);
        let report = ctx.undefined(m).map(|u| u.vars.clone()).unwrap_or_default();
        assert!(report.contains(&x));
        assert!(!report.contains(&c));
        Ok(())
    }

    #[test]
    fn test_fully_assigned_scope_is_untouched() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let x = tree.local(m, "x", 0)?;
        let [b1] = link_chain(tree.cfg_mut(m)?, ["b1"]);
        let cfg = tree.cfg_mut(m)?;
        cfg.push(b1, Instr::copy(x, Operand::Fixnum(1)));
        cfg.push(b1, Instr::Return { value: x.into() });

        let mut ctx = CompilerContext::new(CompilerConfig::default());
        ctx.analyze_liveness(&tree, &[m])?;
        assert!(!MissingInitsPass::new().run_on_scope(&mut tree, m, &mut ctx)?);
        assert!(ctx.events.is_empty());
        Ok(())
    }
}
