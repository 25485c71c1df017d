//! Pass scheduler for orchestrating analyses and rewrites.
//!
//! The `PassScheduler` owns the analysis ordering contract: liveness is computed for every
//! scope before any pass runs, parents before children, and recomputed whenever a pass
//! changed the IR. Passes run in a fixed pipeline order.

use rayon::prelude::*;
use tracing::debug;

use crate::{
    compiler::{
        config::CompilerConfig,
        context::CompilerContext,
        events::EventKind,
        pass::ScopePass,
        passes::{BindingPlacementPass, DeadCodeEliminationPass, MissingInitsPass, UnboxingPass},
    },
    ir::{ScopeId, ScopeTree},
    Result,
};

/// Orchestrates pass execution over one scope tree.
///
/// The default pipeline, each stage enabled by [`CompilerConfig`]:
///
/// 1. **Dead code elimination**
/// 2. **Missing initializations**
/// 3. **Binding placement**: stores then loads, per scope
/// 4. **Unboxing**: once from the root, closures included
///
/// Liveness is (re)computed before the first pass and after every pass that changed the
/// IR, so each pass sees exact results.
pub struct PassScheduler {
    config: CompilerConfig,
    /// The pipeline, in execution order.
    pub passes: Vec<Box<dyn ScopePass>>,
}

impl Default for PassScheduler {
    fn default() -> Self {
        Self::new(CompilerConfig::default())
    }
}

impl PassScheduler {
    /// Creates a scheduler with the pipeline `config` enables.
    #[must_use]
    pub fn new(config: CompilerConfig) -> Self {
        let mut passes: Vec<Box<dyn ScopePass>> = Vec::new();
        if config.dead_code_elimination {
            passes.push(Box::new(DeadCodeEliminationPass::new()));
        }
        if config.missing_inits {
            passes.push(Box::new(MissingInitsPass::new()));
        }
        if config.binding_placement {
            passes.push(Box::new(BindingPlacementPass::new()));
        }
        if config.unboxing {
            passes.push(Box::new(UnboxingPass::new()));
        }
        Self { config, passes }
    }

    /// Creates a scheduler that runs exactly `passes`.
    #[must_use]
    pub fn with_passes(config: CompilerConfig, passes: Vec<Box<dyn ScopePass>>) -> Self {
        Self { config, passes }
    }

    /// The configuration handed to every context.
    #[must_use]
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Names of the passes, in execution order.
    #[must_use]
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Runs one pass over every scope of `scopes` (or once on `root` for global passes).
    ///
    /// Returns `true` if the pass changed the IR.
    fn run_pass(
        pass: &dyn ScopePass,
        tree: &mut ScopeTree,
        root: ScopeId,
        scopes: &[ScopeId],
        ctx: &mut CompilerContext,
    ) -> Result<bool> {
        if pass.is_global() {
            if !pass.should_run(tree, root, ctx) {
                return Ok(false);
            }
            return pass.run_global(tree, root, ctx);
        }

        let mut changed = false;
        for &scope in scopes {
            if pass.should_run(tree, scope, ctx) && pass.run_on_scope(tree, scope, ctx)? {
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Compiles the tree below `root` and returns the published results.
    ///
    /// # Errors
    ///
    /// Returns the first error of any analysis or pass; the tree may then be partially
    /// rewritten and must be discarded.
    pub fn run(&self, tree: &mut ScopeTree, root: ScopeId) -> Result<CompilerContext> {
        let mut ctx = CompilerContext::new(self.config.clone());
        let scopes = tree.preorder(root)?;
        ctx.analyze_liveness(tree, &scopes)?;

        for pass in &self.passes {
            ctx.events
                .record(EventKind::PassStarted)
                .scope(root)
                .message(pass.name());
            let changed = Self::run_pass(pass.as_ref(), tree, root, &scopes, &mut ctx)?;
            if changed && pass.invalidates_liveness() {
                ctx.analyze_liveness(tree, &scopes)?;
            }
            ctx.events
                .record(EventKind::PassCompleted)
                .scope(root)
                .message(pass.name());
            debug!(%root, pass = pass.name(), changed, "pass completed");
        }

        debug!(%root, scopes = scopes.len(), summary = %ctx.events.summary(), "pipeline done");
        Ok(ctx)
    }

    /// Compiles every root of `tree`, in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing root.
    pub fn run_all(&self, tree: &mut ScopeTree) -> Result<Vec<(ScopeId, CompilerContext)>> {
        let roots: Vec<ScopeId> = tree.roots().collect();
        let mut results = Vec::with_capacity(roots.len());
        for root in roots {
            results.push((root, self.run(tree, root)?));
        }
        Ok(results)
    }

    /// Compiles independent trees in parallel.
    ///
    /// Each tree gets its own contexts and problem instances; one tree's failure does not
    /// affect the others.
    pub fn run_many(&self, trees: &mut [ScopeTree]) -> Vec<Result<Vec<(ScopeId, CompilerContext)>>> {
        trees.par_iter_mut().map(|tree| self.run_all(tree)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::CompilerConfig,
        ir::{Instr, Operand},
        test::link_chain,
    };

    struct CountingPass {
        name: &'static str,
    }

    impl ScopePass for CountingPass {
        fn name(&self) -> &'static str {
            self.name
        }

        fn run_on_scope(
            &self,
            tree: &mut ScopeTree,
            scope: ScopeId,
            ctx: &mut CompilerContext,
        ) -> Result<bool> {
            ctx.liveness(scope)?;
            ctx.events
                .record(EventKind::Info)
                .scope(scope)
                .message(tree.scope(scope)?.name.clone());
            Ok(false)
        }
    }

    fn tree_with_closure() -> Result<(ScopeTree, ScopeId)> {
        let mut tree = ScopeTree::new();
        let m = tree.add_method("m");
        let blk = tree.add_closure(m, "blk")?;
        let x = tree.local(m, "x", 0)?;
        let [b1] = link_chain(tree.cfg_mut(m)?, ["b1"]);
        tree.cfg_mut(m)?.push(b1, Instr::copy(x, Operand::Fixnum(1)));
        tree.cfg_mut(m)?.push(b1, Instr::Return { value: x.into() });
        link_chain(tree.cfg_mut(blk)?, ["c1"]);
        Ok((tree, m))
    }

    #[test]
    fn test_default_pipeline_order() {
        let scheduler = PassScheduler::default();
        assert_eq!(
            scheduler.pass_names(),
            vec!["dead-code-elimination", "missing-inits", "binding-placement"]
        );
        let all = PassScheduler::new(CompilerConfig::default().with_unboxing(true));
        assert_eq!(all.pass_names().last(), Some(&"unboxing"));
        assert!(PassScheduler::new(CompilerConfig::analysis_only()).passes.is_empty());
    }

    #[test]
    fn test_passes_see_liveness_of_every_scope() -> Result<()> {
        let (mut tree, m) = tree_with_closure()?;
        let scheduler = PassScheduler::with_passes(
            CompilerConfig::default(),
            vec![Box::new(CountingPass { name: "count" })],
        );
        let ctx = scheduler.run(&mut tree, m)?;
        assert_eq!(ctx.events.count(EventKind::Info), 2);
        assert_eq!(ctx.events.count(EventKind::PassStarted), 1);
        assert_eq!(ctx.events.count(EventKind::PassCompleted), 1);
        Ok(())
    }

    #[test]
    fn test_run_many_keeps_trees_independent() -> Result<()> {
        let mut trees = vec![tree_with_closure()?.0, tree_with_closure()?.0];
        let results = PassScheduler::default().run_many(&mut trees);
        assert_eq!(results.len(), 2);
        for result in results {
            let contexts = result?;
            assert_eq!(contexts.len(), 1);
        }
        Ok(())
    }
}
