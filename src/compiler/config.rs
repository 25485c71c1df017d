//! Configuration for the compiler driver.
//!
//! [`CompilerConfig`] selects which rewrite passes the [`PassScheduler`](super::PassScheduler)
//! runs and bounds the fixed-point engine.

use crate::analysis::DEFAULT_MAX_VISITS_PER_BLOCK;

/// Configuration for the pass pipeline.
///
/// Every pass except unboxing is enabled by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Per-block visit bound of every solve (default: 1000).
    pub max_visits_per_block: usize,

    /// Delete instructions whose effect is unobservable.
    pub dead_code_elimination: bool,

    /// Insert `v = nil` for locals read before any assignment.
    pub missing_inits: bool,

    /// Place closure-binding stores and loads.
    pub binding_placement: bool,

    /// Rewrite scalar arithmetic onto unboxed values.
    pub unboxing: bool,

    /// Re-check every liveness solution for idempotence (slow).
    pub verify_fixpoints: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_visits_per_block: DEFAULT_MAX_VISITS_PER_BLOCK,
            dead_code_elimination: true,
            missing_inits: true,
            binding_placement: true,
            unboxing: false,
            verify_fixpoints: false,
        }
    }
}

impl CompilerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with every analysis-driven rewrite switched off.
    ///
    /// Only liveness is computed; useful for inspecting analysis results.
    #[must_use]
    pub fn analysis_only() -> Self {
        Self {
            dead_code_elimination: false,
            missing_inits: false,
            binding_placement: false,
            unboxing: false,
            ..Self::default()
        }
    }

    /// Sets the per-block visit bound.
    #[must_use]
    pub fn with_max_visits_per_block(mut self, max_visits_per_block: usize) -> Self {
        self.max_visits_per_block = max_visits_per_block;
        self
    }

    /// Enables or disables dead-code elimination.
    #[must_use]
    pub fn with_dead_code_elimination(mut self, enabled: bool) -> Self {
        self.dead_code_elimination = enabled;
        self
    }

    /// Enables or disables missing-initialization synthesis.
    #[must_use]
    pub fn with_missing_inits(mut self, enabled: bool) -> Self {
        self.missing_inits = enabled;
        self
    }

    /// Enables or disables binding placement.
    #[must_use]
    pub fn with_binding_placement(mut self, enabled: bool) -> Self {
        self.binding_placement = enabled;
        self
    }

    /// Enables or disables unboxing.
    #[must_use]
    pub fn with_unboxing(mut self, enabled: bool) -> Self {
        self.unboxing = enabled;
        self
    }

    /// Enables or disables fixpoint verification of liveness solutions.
    #[must_use]
    pub fn with_verify_fixpoints(mut self, enabled: bool) -> Self {
        self.verify_fixpoints = enabled;
        self
    }
}
