//! Program analysis over the scope IR.
//!
//! This module holds the dataflow framework and the analyses built on it. The IR it
//! reads lives in [`crate::ir`], and the passes that consume its results live in
//! [`crate::compiler`].
//!
//! # Architecture
//!
//! - [`dataflow`] - Fixed-point engine and the concrete analyses
//!
//! # Usage
//!
//! ```rust,ignore
//! use scopeflow::analysis::{DataFlowSolver, DefinedVariables};
//!
//! let solution = DataFlowSolver::new(DefinedVariables::new(scope)).solve(&tree)?;
//! let undefined = solution.identify_inits(&tree)?;
//! ```

pub mod dataflow;

// Re-export primary types at module level
pub use dataflow::{
    BlockLoads, BlockStores, DataFlowProblem, DataFlowSolver, DataFlowVarIndex, DeadInstructions,
    DefinedVariables, Direction, FlowContext, FlowNode, LiveOutSets, LiveVariables,
    LoadPlacement, LoadPlan, RenameMap, Solution, StorePlacement, StorePlan, StoreReport,
    UnboxState, UnboxableOps, UnboxingCache, UnboxingReport, UndefinedVariable,
    UndefinedVariables, ValueType, DEFAULT_MAX_VISITS_PER_BLOCK,
};
