//! The table of operator calls that have an unboxed form.

use crate::ir::{AluOp, Operand, UnboxedType};

use super::state::ValueType;

/// Returns the unboxed operator for `method` on the given path.
///
/// Only [`UnboxedType::Float`] and [`UnboxedType::Fixnum`] are arithmetic paths; bitwise
/// operators exist on the fixnum path only.
#[must_use]
pub fn alu_op(method: &str, path: UnboxedType) -> Option<AluOp> {
    let op = match (path, method) {
        (UnboxedType::Float, "+") => AluOp::FAdd,
        (UnboxedType::Float, "-") => AluOp::FSub,
        (UnboxedType::Float, "*") => AluOp::FMul,
        (UnboxedType::Float, "/") => AluOp::FDiv,
        (UnboxedType::Float, "<") => AluOp::FLt,
        (UnboxedType::Float, ">") => AluOp::FGt,
        (UnboxedType::Float, "==") => AluOp::FEq,
        (UnboxedType::Fixnum, "+") => AluOp::IAdd,
        (UnboxedType::Fixnum, "-") => AluOp::ISub,
        (UnboxedType::Fixnum, "*") => AluOp::IMul,
        (UnboxedType::Fixnum, "/") => AluOp::IDiv,
        (UnboxedType::Fixnum, "<") => AluOp::ILt,
        (UnboxedType::Fixnum, ">") => AluOp::IGt,
        (UnboxedType::Fixnum, "==") => AluOp::IEq,
        (UnboxedType::Fixnum, "|") => AluOp::IOr,
        (UnboxedType::Fixnum, "&") => AluOp::IAnd,
        (UnboxedType::Fixnum, "^") => AluOp::IXor,
        (UnboxedType::Fixnum, "<<") => AluOp::IShl,
        (UnboxedType::Fixnum, ">>") => AluOp::IShr,
        _ => return None,
    };
    Some(op)
}

/// Picks the unboxed path for `receiver.method(arg)` from the operand types.
///
/// A float operand forces the float path (a fixnum receiver with a float argument
/// included); two fixnums take the fixnum path. The operator must exist on that path.
#[must_use]
pub fn select_path(
    method: &str,
    receiver: Option<ValueType>,
    arg: Option<ValueType>,
) -> Option<(UnboxedType, AluOp)> {
    let path = match (receiver, arg) {
        (Some(ValueType::Float), _) | (Some(ValueType::Fixnum), Some(ValueType::Float)) => {
            UnboxedType::Float
        }
        (Some(ValueType::Fixnum), Some(ValueType::Fixnum)) => UnboxedType::Fixnum,
        _ => return None,
    };
    alu_op(method, path).map(|op| (path, op))
}

/// Returns `true` for operators with no unboxed form that still map two fixnums to a
/// fixnum.
#[must_use]
pub fn keeps_fixnum(method: &str) -> bool {
    matches!(method, "%" | "<=>")
}

/// Converts a boxed constant into its unboxed form for `path`.
///
/// Fixnum constants on the float path are widened. Anything else is returned unchanged.
#[must_use]
pub fn unbox_constant(operand: &Operand, path: UnboxedType) -> Operand {
    match (operand, path) {
        (Operand::Fixnum(n), UnboxedType::Float) => Operand::UnboxedFloat(*n as f64),
        (Operand::Fixnum(n), _) => Operand::UnboxedFixnum(*n),
        (Operand::Float(x), _) => Operand::UnboxedFloat(*x),
        (Operand::Boolean(b), _) => Operand::UnboxedBoolean(*b),
        _ => operand.clone(),
    }
}
