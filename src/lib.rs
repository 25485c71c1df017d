// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # scopeflow
//!
//! The optimization middle-end of a method and closure compiler for a dynamic,
//! closure-heavy language. `scopeflow` provides a generic fixed-point dataflow framework
//! over a control-flow graph, the analyses built on it, and the IR rewrites they drive.
//!
//! # Architecture
//!
//! The library is organized into layers, leaves first:
//!
//! - **IR Layer**: Scopes, variables, instructions, basic blocks and CFGs
//! - **Analysis Layer**: The dataflow engine and the concrete analyses
//! - **Compiler Layer**: Rewrite passes, their scheduling, and the event log
//!
//! ## Key Components
//!
//! - [`crate::ir`] - The data model: [`ir::ScopeTree`], [`ir::Cfg`], [`ir::Instr`]
//! - [`crate::analysis`] - [`analysis::DataFlowSolver`] and the analyses:
//!   - [`analysis::LiveVariables`] - which variables are live at each point
//!   - [`analysis::DefinedVariables`] - which variables are definitely assigned
//!   - [`analysis::StorePlacement`] / [`analysis::LoadPlacement`] - closure binding traffic
//!   - [`analysis::UnboxableOps`] - scalar arithmetic on unboxed values
//! - [`crate::compiler`] - [`compiler::PassScheduler`] and the built-in passes
//! - [`crate::Error`] and [`crate::Result`] - Error handling
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use scopeflow::prelude::*;
//!
//! let mut tree = ScopeTree::new();
//! let method = tree.add_method("sum");
//! let x = tree.local(method, "x", 0)?;
//! let body = tree.cfg_mut(method)?.add_block("body");
//! let cfg = tree.cfg_mut(method)?;
//! cfg.add_edge(cfg.entry(), body, EdgeKind::FallThrough);
//! cfg.add_edge(body, cfg.exit(), EdgeKind::Exit);
//! cfg.push(body, Instr::copy(x, Operand::Fixnum(1)));
//! cfg.push(body, Instr::Return { value: x.into() });
//!
//! let ctx = PassScheduler::default().run(&mut tree, method)?;
//! println!("{}", ctx.events.summary());
//! # Ok::<(), scopeflow::Error>(())
//! ```
//!
//! # Error Handling
//!
//! Every failure is an internal-consistency violation reported as [`Error`]: an analysis
//! scheduled out of order, an IR invariant broken by an earlier rewrite, or a solve that
//! did not converge. The driver stops at the first error of a tree.
//!
//! # Thread Safety
//!
//! A scope tree is compiled on one thread. Independent trees can be compiled in parallel
//! with [`compiler::PassScheduler::run_many`].

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use scopeflow::prelude::*;
///
/// let mut tree = ScopeTree::new();
/// let method = tree.add_method("m");
/// let live = DataFlowSolver::new(LiveVariables::new(&tree, method, [])?).solve(&tree)?;
/// # Ok::<(), scopeflow::Error>(())
/// ```
pub mod prelude;

/// The intermediate representation the analyses run on.
///
/// - [`ir::ScopeTree`] - arena of methods, scripts and closures sharing one variable table
/// - [`ir::Cfg`] - basic blocks, typed edges and rescuer (exception handler) queries
/// - [`ir::Instr`] - the closed instruction set with capability flags
pub mod ir;

/// Dataflow framework and concrete analyses.
pub mod analysis;

/// Rewrite passes and the driver that schedules them.
pub mod compiler;

/// Bit sets and generic graph traversals.
pub mod utils;

/// `scopeflow` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `scopeflow` Error type
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust,no_run
/// use scopeflow::{compiler::CompilerContext, compiler::CompilerConfig, Error};
/// use scopeflow::ir::ScopeTree;
///
/// let mut tree = ScopeTree::new();
/// let method = tree.add_method("m");
/// let ctx = CompilerContext::new(CompilerConfig::default());
/// match ctx.liveness(method) {
///     Err(Error::MissingSolution { analysis, scope }) => println!("{analysis} missing for {scope}"),
///     Err(e) => println!("Error: {}", e),
///     Ok(_) => println!("liveness ready"),
/// }
/// ```
pub use error::Error;
