//! The IR data model the analyses run over.
//!
//! # Architecture
//!
//! ```text
//! ScopeTree ─┬─ Scope (method / script / closure) ── Cfg ── BasicBlock ── Instr ── Operand
//!            └─ VariableTable ── Variable (VarId handles)
//! ```
//!
//! - [`ScopeTree`] - arena of scopes plus the shared variable table
//! - [`Cfg`] - blocks, typed edges, rescuer map, synthesized entry/exit/global-ensure blocks
//! - [`Instr`] - closed instruction set with effect flags
//! - [`VariableTable`] - locals interned per (scope, name, depth), fresh temporaries

mod block;
mod cfg;
mod instruction;
mod operand;
mod scope;
mod variable;

pub use block::{BasicBlock, BlockFlags, BlockId};
pub use cfg::{Cfg, Edge, EdgeKind};
pub use instruction::{AluOp, CallInstr, Instr, InstrFlags, Operation};
pub use operand::Operand;
pub use scope::{LocalUsage, Scope, ScopeId, ScopeKind, ScopeTree};
pub use variable::{BindingSlot, UnboxedType, VarId, Variable, VariableKind, VariableTable};
