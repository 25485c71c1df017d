//! Built-in rewrite passes, in pipeline order.

mod binding;
mod deadcode;
mod inits;
mod unboxing;

pub use binding::BindingPlacementPass;
pub use deadcode::DeadCodeEliminationPass;
pub use inits::MissingInitsPass;
pub use unboxing::UnboxingPass;
