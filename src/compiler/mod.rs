//! Compiler driver: rewrite passes over the scope IR.
//!
//! This module is the layer between analysis and whatever consumes the optimized IR:
//!
//! - [`crate::analysis`] - dataflow engine and concrete analyses
//! - [`compiler`](self) - passes, their scheduling, and published results
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Compiler Pipeline                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  CompilerContext              Published results of one tree      │
//! │    ├─ Liveness solutions      (per scope, recomputed on change)  │
//! │    ├─ Undefined reads         (per scope diagnostics)            │
//! │    ├─ Rename maps             (shared by stores and loads)       │
//! │    ├─ Unboxing cache          (closure sub-solutions)            │
//! │    └─ EventLog                                                   │
//! │                                                                  │
//! │  PassScheduler               Fixed pipeline, liveness first      │
//! │    ├─ Dead code elimination                                      │
//! │    ├─ Missing initializations                                    │
//! │    ├─ Binding placement       (stores, then loads)               │
//! │    └─ Unboxing                (root first, closures recursively) │
//! │                                                                  │
//! │  ScopePass trait             Interface for all passes            │
//! │    ├─ run_on_scope()          Per-scope transformation           │
//! │    └─ run_global()            Whole-tree transformation          │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use scopeflow::compiler::{CompilerConfig, PassScheduler};
//!
//! let scheduler = PassScheduler::new(CompilerConfig::default().with_unboxing(true));
//! let ctx = scheduler.run(&mut tree, root)?;
//! println!("{}", ctx.events.summary());
//! ```

mod config;
mod context;
mod events;
mod pass;
mod passes;
mod scheduler;

pub use config::CompilerConfig;
pub use context::CompilerContext;
pub use events::{Event, EventBuilder, EventKind, EventLog};
pub use pass::ScopePass;
pub use passes::{BindingPlacementPass, DeadCodeEliminationPass, MissingInitsPass, UnboxingPass};
pub use scheduler::PassScheduler;
