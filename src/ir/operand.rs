//! Instruction operands.

use std::fmt;

use crate::ir::{ScopeId, UnboxedType, VarId};

/// An instruction operand.
///
/// Boxed constants (`Fixnum`, `Float`, ...) are heap values at run time; the
/// `Unboxed*` forms are machine scalars produced by the unboxing rewrite.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A variable reference.
    Var(VarId),
    /// Boxed integer constant.
    Fixnum(i64),
    /// Boxed float constant.
    Float(f64),
    /// Boolean constant.
    Boolean(bool),
    /// The nil constant.
    Nil,
    /// String literal.
    Str(String),
    /// Unboxed integer constant.
    UnboxedFixnum(i64),
    /// Unboxed float constant.
    UnboxedFloat(f64),
    /// Unboxed boolean constant.
    UnboxedBoolean(bool),
    /// A nested closure passed as a block argument or captured by a lambda.
    Closure(ScopeId),
}

impl Operand {
    /// Returns the variable when this operand is a variable reference.
    #[must_use]
    pub fn as_var(&self) -> Option<VarId> {
        match self {
            Self::Var(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the closure when this operand is a real sub-closure.
    #[must_use]
    pub fn as_closure(&self) -> Option<ScopeId> {
        match self {
            Self::Closure(s) => Some(*s),
            _ => None,
        }
    }

    /// Returns the representation of an unboxed constant.
    #[must_use]
    pub fn unboxed_type(&self) -> Option<UnboxedType> {
        match self {
            Self::UnboxedFixnum(_) => Some(UnboxedType::Fixnum),
            Self::UnboxedFloat(_) => Some(UnboxedType::Float),
            Self::UnboxedBoolean(_) => Some(UnboxedType::Boolean),
            _ => None,
        }
    }

    pub(crate) fn rename(&mut self, map: &impl Fn(VarId) -> Option<VarId>) {
        if let Self::Var(v) = self {
            if let Some(new) = map(*v) {
                *v = new;
            }
        }
    }
}

impl From<VarId> for Operand {
    fn from(v: VarId) -> Self {
        Self::Var(v)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(v) => write!(f, "{v}"),
            Self::Fixnum(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Nil => f.write_str("nil"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::UnboxedFixnum(n) => write!(f, "<{n}>"),
            Self::UnboxedFloat(x) => write!(f, "<{x:?}>"),
            Self::UnboxedBoolean(b) => write!(f, "<{b}>"),
            Self::Closure(s) => write!(f, "closure({s})"),
        }
    }
}
