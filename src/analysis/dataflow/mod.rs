//! Dataflow analysis framework over the scope IR.
//!
//! This module provides a generic fixed-point engine for computing properties that
//! propagate along control flow edges, and the concrete analyses the compiler runs on
//! every scope. Both forward and backward problems are supported by a worklist solver.
//!
//! # Architecture
//!
//! - **Problem** ([`DataFlowProblem`]): direction, per-block state, meet and transfer
//! - **Node** ([`FlowNode`]): per-block `in`/`out` states, owned by the solution
//! - **Solver** ([`DataFlowSolver`]): iterates problems to their fixpoint
//!
//! # Analyses Provided
//!
//! - [`LiveVariables`]: which variables are live at each program point
//! - [`DefinedVariables`]: which variables are definitely assigned
//! - [`StorePlacement`]: where captured locals are spilled to their closure binding
//! - [`LoadPlacement`]: where captured locals are reloaded from their closure binding
//! - [`UnboxableOps`]: which scalar operations run on unboxed values
//!
//! # Scheduling
//!
//! Liveness runs first on every scope. Store- and load-placement consult it, and unboxing
//! runs last. [`crate::compiler::PassScheduler`] enforces this order.
//!
//! # Example
//!
//! ```rust,ignore
//! use scopeflow::analysis::{DataFlowSolver, LiveVariables};
//!
//! let problem = LiveVariables::new(&tree, scope, std::iter::empty())?;
//! let solution = DataFlowSolver::new(problem).solve(&tree)?;
//! for var in solution.vars_live_on_scope_entry(&tree)? {
//!     println!("live on entry: {var}");
//! }
//! ```

mod defined;
mod framework;
mod liveness;
mod loads;
mod solver;
mod stores;
mod unboxing;
mod vars;

pub use defined::{DefinedVariables, UndefinedVariable, UndefinedVariables};
pub use framework::{DataFlowProblem, Direction, FlowContext, FlowNode, Solution};
pub use liveness::{DeadInstructions, LiveVariables};
pub use loads::{BlockLoads, LoadPlacement, LoadPlan};
pub use solver::{DataFlowSolver, DEFAULT_MAX_VISITS_PER_BLOCK};
pub use stores::{BlockStores, RenameMap, StorePlacement, StorePlan, StoreReport};
pub use unboxing::{
    alu_op, select_path, unbox_constant, LiveOutSets, UnboxState, UnboxableOps, UnboxingCache,
    UnboxingReport, ValueType,
};
pub use vars::DataFlowVarIndex;
