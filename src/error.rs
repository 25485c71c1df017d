use thiserror::Error;

use crate::ir::{BlockId, ScopeId, VarId};

macro_rules! internal_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Internal {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Internal {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every variant describes an internal-consistency violation: the input scope tree is assumed
/// to be well formed, so an error means an analysis was scheduled out of order, an IR invariant
/// was broken by an earlier rewrite, or the fixed-point engine failed to converge. None of them
/// is recoverable for the scope being compiled, and the driver aborts at the first one.
///
/// # Error Categories
///
/// ## Dataflow Errors
/// - [`Error::MissingDataflowVar`] - A variable was never registered with a problem's index
/// - [`Error::NonConvergence`] - The worklist exceeded its visit bound
/// - [`Error::MissingSolution`] - A pass asked for an analysis that has not run yet
///
/// ## Rewrite Errors
/// - [`Error::MissingUnboxedVar`] - Boxing requested for a variable with no unboxed scratch
/// - [`Error::GlobalEnsureExists`] - A second global ensure block was requested
///
/// ## Lookup Errors
/// - [`Error::UnknownScope`] / [`Error::UnknownBlock`] - Dangling handles
/// - [`Error::Internal`] - Anything else, with source location
///
/// # Examples
///
/// ```rust,ignore
/// use scopeflow::{Error, compiler::PassScheduler};
///
/// match PassScheduler::default().run(&mut tree, root) {
///     Ok(ctx) => println!("{}", ctx.events.summary()),
///     Err(Error::NonConvergence { problem, scope, visits }) => {
///         eprintln!("{problem} diverged on {scope} after {visits} visits");
///     }
///     Err(e) => eprintln!("compilation failed: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// A variable was looked up in a problem's dataflow variable index but was never
    /// registered during setup.
    ///
    /// Every variable an instruction mentions is registered before solving, so this
    /// indicates the IR was mutated between setup and the query.
    #[error("{problem}: variable {var} has no dataflow index")]
    MissingDataflowVar {
        /// Name of the problem whose index was queried
        problem: &'static str,
        /// The unregistered variable
        var: VarId,
    },

    /// Boxing was requested for a variable that has no unboxed scratch variable.
    #[error("no unboxed scratch variable registered for {0}")]
    MissingUnboxedVar(VarId),

    /// The fixed-point loop exceeded its visit bound.
    ///
    /// Every shipped lattice has finite height, so this means a transfer function is not
    /// monotone. The scope cannot be compiled.
    #[error("{problem} did not converge for {scope} after {visits} block visits")]
    NonConvergence {
        /// Name of the diverging problem
        problem: &'static str,
        /// Scope the problem was bound to
        scope: ScopeId,
        /// Number of block visits performed before giving up
        visits: usize,
    },

    /// An analysis result was requested before the analysis ran.
    #[error("{analysis} solution for {scope} is not available")]
    MissingSolution {
        /// The analysis that should have been run first
        analysis: &'static str,
        /// The scope whose result was requested
        scope: ScopeId,
    },

    /// A CFG already owns a global ensure block.
    #[error("CFG of {0} already has a global ensure block")]
    GlobalEnsureExists(ScopeId),

    /// A scope handle does not belong to the tree.
    #[error("unknown scope {0}")]
    UnknownScope(ScopeId),

    /// A block handle does not belong to the CFG.
    #[error("unknown block {0}")]
    UnknownBlock(BlockId),

    /// An internal invariant was violated.
    ///
    /// # Fields
    ///
    /// * `message` - Description of the violated invariant
    /// * `file` - Source file where the violation was detected
    /// * `line` - Source line where the violation was detected
    #[error("Internal - {file}:{line}: {message}")]
    Internal {
        /// The message to be printed for the Internal error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },
}
