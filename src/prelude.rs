//! # scopeflow Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the scopeflow library. Import it to build scope trees, run analyses and drive the
//! pass pipeline.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all scopeflow operations
pub use crate::Error;

/// The result type used throughout scopeflow
pub use crate::Result;

// ================================================================================================
// Intermediate Representation
// ================================================================================================

/// Scopes, variables and their handles
pub use crate::ir::{
    BindingSlot, Scope, ScopeId, ScopeKind, ScopeTree, UnboxedType, VarId, Variable, VariableKind,
};

/// Control flow graph
pub use crate::ir::{BasicBlock, BlockId, Cfg, Edge, EdgeKind};

/// Instructions and operands
pub use crate::ir::{AluOp, CallInstr, Instr, InstrFlags, Operand, Operation};

// ================================================================================================
// Dataflow Analysis
// ================================================================================================

/// The fixed-point engine
pub use crate::analysis::{DataFlowProblem, DataFlowSolver, Direction, FlowNode, Solution};

/// Concrete analyses
pub use crate::analysis::{
    DefinedVariables, LiveVariables, LoadPlacement, StorePlacement, UnboxableOps,
};

/// Analysis support types
pub use crate::analysis::{LiveOutSets, RenameMap, UnboxingCache, UndefinedVariables};

// ================================================================================================
// Compiler Driver
// ================================================================================================

/// Pipeline, configuration and results
pub use crate::compiler::{
    CompilerConfig, CompilerContext, EventKind, EventLog, PassScheduler, ScopePass,
};
