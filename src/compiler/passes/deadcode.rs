//! Dead code elimination pass.
//!
//! Deletes every instruction the liveness solution proves unobservable: removable
//! instructions whose result is dead, and the whole body of unreachable blocks.
//!
//! # Example
//!
//! Before:
//! ```text
//! x = 1          // x never read
//! t1 = y + 1     // t1 never read
//! y = 2
//! return y
//! ```
//!
//! After:
//! ```text
//! t1 = y + 1     // a call may raise, so it stays
//! y = 2
//! return y
//! ```
//!
//! Only copies, binding loads and other non-raising, side-effect-free instructions go.

use tracing::debug;

use crate::{
    compiler::{pass::ScopePass, CompilerContext, EventKind},
    ir::{ScopeId, ScopeTree},
    Result,
};

/// Dead code elimination driven by [`LiveVariables`](crate::analysis::LiveVariables).
#[derive(Debug, Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    /// Creates a new dead code elimination pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ScopePass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn description(&self) -> &'static str {
        "Removes instructions whose results are never observed"
    }

    fn run_on_scope(
        &self,
        tree: &mut ScopeTree,
        scope: ScopeId,
        ctx: &mut CompilerContext,
    ) -> Result<bool> {
        let removed = ctx.liveness(scope)?.mark_dead_instructions(tree)?;
        for (block, instr) in &removed {
            ctx.events
                .record(EventKind::InstructionRemoved)
                .at(scope, *block)
                .message(instr.to_string());
        }
        if !removed.is_empty() {
            debug!(%scope, removed = removed.len(), "dead instructions removed");
        }
        Ok(!removed.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::CompilerConfig,
        ir::{Instr, Operand},
        test::{instructions, link_chain},
    };

    #[test]
    fn test_removes_dead_copy_and_keeps_call() -> Result<()> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let x = tree.local(m, "x", 0)?;
        let y = tree.local(m, "y", 0)?;
        let t = tree.new_temporary(m);
        let [b1] = link_chain(tree.cfg_mut(m)?, ["b1"]);
        let cfg = tree.cfg_mut(m)?;
        cfg.push(b1, Instr::copy(x, Operand::Fixnum(1)));
        cfg.push(b1, Instr::call(Some(t), y, "+", vec![Operand::Fixnum(1)]));
        cfg.push(b1, Instr::copy(y, Operand::Fixnum(2)));
        cfg.push(b1, Instr::Return { value: y.into() });

        let mut ctx = CompilerContext::new(CompilerConfig::default());
        ctx.analyze_liveness(&tree, &[m])?;
        assert!(DeadCodeEliminationPass::new().run_on_scope(&mut tree, m, &mut ctx)?);
        assert_eq!(ctx.events.count(EventKind::InstructionRemoved), 1);

        let instrs = instructions(&tree, m);
        assert_eq!(instrs.len(), 3);
        assert!(matches!(&instrs[0], Instr::Call(_)));
        Ok(())
    }
}
