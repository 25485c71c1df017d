//! Pass trait for the compiler pipeline.
//!
//! Every rewrite pass implements [`ScopePass`]. The scheduler runs passes in a fixed order
//! and owns the analysis prerequisites: a pass reads published results from the
//! [`CompilerContext`] and reports whether it changed the IR, so that the scheduler knows
//! when to recompute liveness.

use crate::{
    compiler::context::CompilerContext,
    ir::{ScopeId, ScopeTree},
    Result,
};

/// A rewrite pass over the scopes of one tree.
///
/// Passes must be thread-safe (Send + Sync) so one scheduler can compile independent trees
/// in parallel. Per-tree state lives in the context, never in the pass.
pub trait ScopePass: Send + Sync {
    /// Unique name for logging and debugging.
    fn name(&self) -> &'static str;

    /// Should this pass run on `scope`?
    ///
    /// Called before [`run_on_scope`](Self::run_on_scope). Override to skip scopes the
    /// pass has nothing to do for.
    fn should_run(&self, _tree: &ScopeTree, _scope: ScopeId, _ctx: &CompilerContext) -> bool {
        true
    }

    /// Runs the pass on a single scope.
    ///
    /// Scopes are visited parents first. Returns `true` if the IR changed; events are
    /// recorded to `ctx.events`.
    ///
    /// # Errors
    ///
    /// Returns an error if a prerequisite is missing or the rewrite fails.
    fn run_on_scope(
        &self,
        tree: &mut ScopeTree,
        scope: ScopeId,
        ctx: &mut CompilerContext,
    ) -> Result<bool>;

    /// Runs the pass once on the whole tree below `root`.
    ///
    /// Only called for passes whose [`is_global`](Self::is_global) is `true`.
    ///
    /// # Errors
    ///
    /// Returns an error if a prerequisite is missing or the rewrite fails.
    fn run_global(
        &self,
        _tree: &mut ScopeTree,
        _root: ScopeId,
        _ctx: &mut CompilerContext,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Does this pass handle nested closures itself, starting from the root?
    fn is_global(&self) -> bool {
        false
    }

    /// Must liveness be recomputed once this pass changed something?
    fn invalidates_liveness(&self) -> bool {
        true
    }

    /// Get a description of what this pass does.
    fn description(&self) -> &'static str {
        "No description available"
    }
}
