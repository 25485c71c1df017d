//! Unboxing pass.
//!
//! Runs [`UnboxableOps`] on a root scope and rewrites it together with every closure the
//! analysis reached. The closure memo table is the context's
//! [`CompilerContext::unboxing`] cache, cleared at the start of each run.

use tracing::debug;

use crate::{
    analysis::UnboxableOps,
    compiler::{pass::ScopePass, CompilerContext, EventKind},
    ir::{ScopeId, ScopeTree},
    Result,
};

/// Replaces scalar operator calls by unboxed arithmetic.
#[derive(Debug, Default)]
pub struct UnboxingPass;

impl UnboxingPass {
    /// Creates a new unboxing pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ScopePass for UnboxingPass {
    fn name(&self) -> &'static str {
        "unboxing"
    }

    fn description(&self) -> &'static str {
        "Runs fixnum and float arithmetic on unboxed values"
    }

    fn is_global(&self) -> bool {
        true
    }

    fn run_on_scope(
        &self,
        tree: &mut ScopeTree,
        scope: ScopeId,
        ctx: &mut CompilerContext,
    ) -> Result<bool> {
        self.run_global(tree, scope, ctx)
    }

    fn run_global(
        &self,
        tree: &mut ScopeTree,
        root: ScopeId,
        ctx: &mut CompilerContext,
    ) -> Result<bool> {
        let scopes = tree.preorder(root)?;
        let live = ctx.live_out_sets(&scopes)?;
        ctx.unboxing.clear();
        let report = UnboxableOps::new(tree, root, &mut ctx.unboxing)?
            .with_visit_limit(ctx.config.max_visits_per_block)
            .solve(tree)?
            .unbox(tree, &live)?;

        let counts = [
            (EventKind::OperationUnboxed, report.operations + report.copies + report.branches),
            (EventKind::BoxInserted, report.boxes),
            (EventKind::UnboxInserted, report.unboxes),
        ];
        for (kind, n) in counts {
            if n > 0 {
                ctx.events
                    .record(kind)
                    .scope(root)
                    .message(format!("{n} across {} scopes", report.scopes));
            }
        }
        debug!(%root, ?report, "unboxing pass done");
        Ok(!report.is_empty())
    }
}
