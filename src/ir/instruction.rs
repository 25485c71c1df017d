//! The instruction set seen by the analyses.
//!
//! Only the shape the dataflow passes need is modelled: which variable an instruction
//! defines, which it reads, whether it carries a closure, and what it may do besides
//! computing its result ([`InstrFlags`]). Host operations the passes do not care about
//! are carried as [`Instr::Opaque`] with explicit flags.

use std::fmt;

use bitflags::bitflags;
use strum::{Display, EnumCount, EnumIter};

use crate::ir::{BlockId, Operand, ScopeId, UnboxedType, VarId};

/// Method names whose callee may inspect or modify the caller's binding.
const BINDING_SENSITIVE_METHODS: &[&str] = &[
    "binding",
    "block_given?",
    "class_eval",
    "eval",
    "instance_eval",
    "local_variables",
    "module_eval",
];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Effects of an instruction beyond defining its result
    pub struct InstrFlags: u8 {
        /// The instruction may raise an exception
        const MAY_RAISE = 0x01;
        /// The instruction has an observable side effect
        const SIDE_EFFECT = 0x02;
        /// The instruction ends the block by transferring control
        const TRANSFERS_CONTROL = 0x04;
    }
}

/// Operation tag of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumCount, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[allow(missing_docs)]
pub enum Operation {
    Copy,
    Call,
    BuildLambda,
    Alu,
    Box,
    Unbox,
    StoreBinding,
    LoadBinding,
    GetGlobal,
    PutGlobal,
    ReceiveArg,
    ReceiveException,
    Jump,
    BranchTrue,
    BranchFalse,
    Return,
    Break,
    Raise,
    Opaque,
}

/// Unboxed arithmetic, comparison and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[allow(missing_docs)]
pub enum AluOp {
    FAdd,
    FSub,
    FMul,
    FDiv,
    FLt,
    FGt,
    FEq,
    IAdd,
    ISub,
    IMul,
    IDiv,
    ILt,
    IGt,
    IEq,
    IOr,
    IAnd,
    IXor,
    IShl,
    IShr,
}

impl AluOp {
    /// Returns `true` for comparisons, whose result is an unboxed boolean.
    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::FLt | Self::FGt | Self::FEq | Self::ILt | Self::IGt | Self::IEq
        )
    }

    /// Representation of the operator's result.
    #[must_use]
    pub fn result_type(self) -> UnboxedType {
        match self {
            _ if self.is_comparison() => UnboxedType::Boolean,
            Self::FAdd | Self::FSub | Self::FMul | Self::FDiv => UnboxedType::Float,
            _ => UnboxedType::Fixnum,
        }
    }
}

/// A dynamic method call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallInstr {
    /// Variable receiving the call's value, if it is used.
    pub dst: Option<VarId>,
    /// Receiver of the call.
    pub receiver: Operand,
    /// Method name.
    pub method: String,
    /// Positional arguments.
    pub args: Vec<Operand>,
    /// Block argument: a real sub-closure, or a variable holding a block.
    pub closure: Option<Operand>,
    /// The callee may read or write the caller's binding.
    pub requires_binding: bool,
}

impl CallInstr {
    /// Creates a call without a block argument.
    pub fn new(
        dst: Option<VarId>,
        receiver: impl Into<Operand>,
        method: &str,
        args: Vec<Operand>,
    ) -> Self {
        Self {
            dst,
            receiver: receiver.into(),
            method: method.to_string(),
            args,
            closure: None,
            requires_binding: BINDING_SENSITIVE_METHODS.contains(&method),
        }
    }

    /// Attaches a block argument.
    #[must_use]
    pub fn with_closure(mut self, closure: Operand) -> Self {
        self.closure = Some(closure);
        self
    }
}

/// An IR instruction.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Instr {
    /// `dst = src`
    Copy { dst: VarId, src: Operand },
    /// Dynamic call, see [`CallInstr`].
    Call(CallInstr),
    /// `dst = lambda(closure)`, capturing the current binding.
    BuildLambda { dst: VarId, closure: ScopeId },
    /// `dst = lhs <op> rhs` on unboxed operands.
    Alu {
        op: AluOp,
        dst: VarId,
        lhs: Operand,
        rhs: Operand,
    },
    /// `dst = box(src)`, converting an unboxed scalar into a heap value.
    Box {
        kind: UnboxedType,
        dst: VarId,
        src: Operand,
    },
    /// `dst = unbox(src)`, converting a heap value into a scalar.
    Unbox {
        kind: UnboxedType,
        dst: VarId,
        src: Operand,
    },
    /// Writes `value` into the binding cell of `slot`.
    StoreBinding { slot: VarId, value: Operand },
    /// Reads the binding cell of `slot` into `dst`.
    LoadBinding { dst: VarId, slot: VarId },
    /// `dst = $name`
    GetGlobal { dst: VarId, name: String },
    /// `$name = value`
    PutGlobal { name: String, value: Operand },
    /// Receives positional argument `index`.
    ReceiveArg { dst: VarId, index: usize },
    /// Receives the in-flight exception at the start of a handler.
    ReceiveException { dst: VarId },
    /// Unconditional jump.
    Jump { target: BlockId },
    /// Jumps to `target` when `arg` is true.
    BranchTrue { arg: Operand, target: BlockId },
    /// Jumps to `target` when `arg` is false.
    BranchFalse { arg: Operand, target: BlockId },
    /// Returns from the scope.
    Return { value: Operand },
    /// Breaks out of the closure's caller.
    Break { value: Operand },
    /// Raises `value`.
    Raise { value: Operand },
    /// A host operation with explicit effects.
    Opaque {
        name: String,
        dst: Option<VarId>,
        args: Vec<Operand>,
        flags: InstrFlags,
    },
}

impl Instr {
    /// Shorthand for an [`Instr::Copy`].
    pub fn copy(dst: VarId, src: impl Into<Operand>) -> Self {
        Self::Copy {
            dst,
            src: src.into(),
        }
    }

    /// Shorthand for a call without a block argument.
    pub fn call(
        dst: Option<VarId>,
        receiver: impl Into<Operand>,
        method: &str,
        args: Vec<Operand>,
    ) -> Self {
        Self::Call(CallInstr::new(dst, receiver, method, args))
    }

    /// Returns the operation tag.
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Self::Copy { .. } => Operation::Copy,
            Self::Call(_) => Operation::Call,
            Self::BuildLambda { .. } => Operation::BuildLambda,
            Self::Alu { .. } => Operation::Alu,
            Self::Box { .. } => Operation::Box,
            Self::Unbox { .. } => Operation::Unbox,
            Self::StoreBinding { .. } => Operation::StoreBinding,
            Self::LoadBinding { .. } => Operation::LoadBinding,
            Self::GetGlobal { .. } => Operation::GetGlobal,
            Self::PutGlobal { .. } => Operation::PutGlobal,
            Self::ReceiveArg { .. } => Operation::ReceiveArg,
            Self::ReceiveException { .. } => Operation::ReceiveException,
            Self::Jump { .. } => Operation::Jump,
            Self::BranchTrue { .. } => Operation::BranchTrue,
            Self::BranchFalse { .. } => Operation::BranchFalse,
            Self::Return { .. } => Operation::Return,
            Self::Break { .. } => Operation::Break,
            Self::Raise { .. } => Operation::Raise,
            Self::Opaque { .. } => Operation::Opaque,
        }
    }

    /// Returns the effects of this instruction.
    #[must_use]
    pub fn flags(&self) -> InstrFlags {
        match self {
            Self::Call(_) => InstrFlags::MAY_RAISE | InstrFlags::SIDE_EFFECT,
            Self::Alu { op, .. } if *op == AluOp::IDiv => InstrFlags::MAY_RAISE,
            Self::StoreBinding { .. } => InstrFlags::SIDE_EFFECT,
            Self::PutGlobal { .. } => InstrFlags::SIDE_EFFECT | InstrFlags::MAY_RAISE,
            Self::Jump { .. } | Self::BranchTrue { .. } | Self::BranchFalse { .. } => {
                InstrFlags::TRANSFERS_CONTROL
            }
            Self::Return { .. } | Self::Break { .. } => {
                InstrFlags::TRANSFERS_CONTROL | InstrFlags::SIDE_EFFECT
            }
            Self::Raise { .. } => {
                InstrFlags::TRANSFERS_CONTROL | InstrFlags::SIDE_EFFECT | InstrFlags::MAY_RAISE
            }
            Self::Opaque { flags, .. } => *flags,
            _ => InstrFlags::empty(),
        }
    }

    /// Returns `true` if the instruction may raise an exception.
    #[must_use]
    pub fn can_raise(&self) -> bool {
        self.flags().contains(InstrFlags::MAY_RAISE)
    }

    /// Returns `true` if the instruction has an observable side effect.
    #[must_use]
    pub fn has_side_effect(&self) -> bool {
        self.flags().contains(InstrFlags::SIDE_EFFECT)
    }

    /// Returns `true` if the instruction ends its block.
    #[must_use]
    pub fn transfers_control(&self) -> bool {
        self.flags().contains(InstrFlags::TRANSFERS_CONTROL)
    }

    /// Returns `true` if deleting the instruction is unobservable once its result is dead.
    #[must_use]
    pub fn is_removable(&self) -> bool {
        self.flags().is_empty()
    }

    /// Returns the variable this instruction defines.
    #[must_use]
    pub fn result(&self) -> Option<VarId> {
        match self {
            Self::Copy { dst, .. }
            | Self::BuildLambda { dst, .. }
            | Self::Alu { dst, .. }
            | Self::Box { dst, .. }
            | Self::Unbox { dst, .. }
            | Self::LoadBinding { dst, .. }
            | Self::GetGlobal { dst, .. }
            | Self::ReceiveArg { dst, .. }
            | Self::ReceiveException { dst } => Some(*dst),
            Self::Call(call) => call.dst,
            Self::Opaque { dst, .. } => *dst,
            _ => None,
        }
    }

    /// Returns the operands this instruction reads, in source order.
    #[must_use]
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Self::Copy { src, .. } | Self::Box { src, .. } | Self::Unbox { src, .. } => vec![src],
            Self::Call(call) => std::iter::once(&call.receiver)
                .chain(&call.args)
                .chain(call.closure.as_ref())
                .collect(),
            Self::Alu { lhs, rhs, .. } => vec![lhs, rhs],
            Self::StoreBinding { value, .. }
            | Self::PutGlobal { value, .. }
            | Self::Return { value }
            | Self::Break { value }
            | Self::Raise { value } => vec![value],
            Self::BranchTrue { arg, .. } | Self::BranchFalse { arg, .. } => vec![arg],
            Self::Opaque { args, .. } => args.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Returns the variables this instruction reads.
    ///
    /// The binding slot of a [`Instr::StoreBinding`] or [`Instr::LoadBinding`] is not a
    /// read of that variable.
    #[must_use]
    pub fn used_variables(&self) -> Vec<VarId> {
        self.operands().into_iter().filter_map(Operand::as_var).collect()
    }

    /// Returns `true` if the instruction can carry a closure argument.
    #[must_use]
    pub fn accepts_closure(&self) -> bool {
        matches!(self, Self::Call(_) | Self::BuildLambda { .. })
    }

    /// Returns the real (not inlined) sub-closure this instruction carries.
    #[must_use]
    pub fn sub_closure(&self) -> Option<ScopeId> {
        match self {
            Self::Call(call) => call.closure.as_ref().and_then(Operand::as_closure),
            Self::BuildLambda { closure, .. } => Some(*closure),
            _ => None,
        }
    }

    /// Returns `true` for calls whose target may read the caller's binding.
    #[must_use]
    pub fn requires_callers_binding(&self) -> bool {
        matches!(self, Self::Call(call) if call.requires_binding)
    }

    /// Returns the explicit branch target of a jump or conditional branch.
    #[must_use]
    pub fn branch_target(&self) -> Option<BlockId> {
        match self {
            Self::Jump { target }
            | Self::BranchTrue { target, .. }
            | Self::BranchFalse { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Renames every read and written variable through `map`.
    ///
    /// Binding slots are left untouched: they name a heap cell, not a value. The destination
    /// of a [`Instr::LoadBinding`] is renamed like any other result.
    pub fn rename_vars(&mut self, map: &impl Fn(VarId) -> Option<VarId>) {
        let rename_dst = |dst: &mut VarId| {
            if let Some(new) = map(*dst) {
                *dst = new;
            }
        };
        match self {
            Self::Copy { dst, src } | Self::Box { dst, src, .. } | Self::Unbox { dst, src, .. } => {
                rename_dst(dst);
                src.rename(map);
            }
            Self::Call(call) => {
                if let Some(dst) = call.dst.as_mut() {
                    rename_dst(dst);
                }
                call.receiver.rename(map);
                for arg in &mut call.args {
                    arg.rename(map);
                }
                if let Some(closure) = call.closure.as_mut() {
                    closure.rename(map);
                }
            }
            Self::Alu { dst, lhs, rhs, .. } => {
                rename_dst(dst);
                lhs.rename(map);
                rhs.rename(map);
            }
            Self::BuildLambda { dst, .. }
            | Self::LoadBinding { dst, .. }
            | Self::GetGlobal { dst, .. }
            | Self::ReceiveArg { dst, .. }
            | Self::ReceiveException { dst } => rename_dst(dst),
            Self::StoreBinding { value, .. }
            | Self::PutGlobal { value, .. }
            | Self::Return { value }
            | Self::Break { value }
            | Self::Raise { value } => value.rename(map),
            Self::BranchTrue { arg, .. } | Self::BranchFalse { arg, .. } => arg.rename(map),
            Self::Opaque { dst, args, .. } => {
                if let Some(dst) = dst.as_mut() {
                    rename_dst(dst);
                }
                for arg in args {
                    arg.rename(map);
                }
            }
            Self::Jump { .. } => {}
        }
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[Operand]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{arg}")?;
    }
    Ok(())
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dst) = self.result() {
            write!(f, "{dst} = ")?;
        }
        match self {
            Self::Copy { src, .. } => write!(f, "copy({src})"),
            Self::Call(call) => {
                write!(f, "call {}.{}(", call.receiver, call.method)?;
                write_args(f, &call.args)?;
                f.write_str(")")?;
                match &call.closure {
                    Some(closure) => write!(f, " &{closure}"),
                    None => Ok(()),
                }
            }
            Self::BuildLambda { closure, .. } => write!(f, "lambda({closure})"),
            Self::Alu { op, lhs, rhs, .. } => write!(f, "{op}({lhs}, {rhs})"),
            Self::Box { kind, src, .. } => write!(f, "box_{kind}({src})"),
            Self::Unbox { kind, src, .. } => write!(f, "unbox_{kind}({src})"),
            Self::StoreBinding { slot, value } => write!(f, "store_binding({slot}, {value})"),
            Self::LoadBinding { slot, .. } => write!(f, "load_binding({slot})"),
            Self::GetGlobal { name, .. } => write!(f, "get_global(${name})"),
            Self::PutGlobal { name, value } => write!(f, "put_global(${name}, {value})"),
            Self::ReceiveArg { index, .. } => write!(f, "recv_arg({index})"),
            Self::ReceiveException { .. } => f.write_str("recv_exception"),
            Self::Jump { target } => write!(f, "jump {target}"),
            Self::BranchTrue { arg, target } => write!(f, "b_true({arg}, {target})"),
            Self::BranchFalse { arg, target } => write!(f, "b_false({arg}, {target})"),
            Self::Return { value } => write!(f, "return({value})"),
            Self::Break { value } => write!(f, "break({value})"),
            Self::Raise { value } => write!(f, "raise({value})"),
            Self::Opaque { name, args, .. } => {
                write!(f, "{name}(")?;
                write_args(f, args)?;
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_detects_binding_sensitive_targets() {
        let eval = CallInstr::new(None, Operand::Nil, "eval", vec![Operand::Str("x".into())]);
        assert!(eval.requires_binding);
        let plus = CallInstr::new(None, Operand::Fixnum(1), "+", vec![Operand::Fixnum(2)]);
        assert!(!plus.requires_binding);
    }

    #[test]
    fn test_used_variables_skip_binding_slots() {
        let store = Instr::StoreBinding {
            slot: VarId(0),
            value: Operand::Var(VarId(1)),
        };
        assert_eq!(store.used_variables(), vec![VarId(1)]);
        assert_eq!(store.result(), None);

        let load = Instr::LoadBinding {
            dst: VarId(2),
            slot: VarId(0),
        };
        assert!(load.used_variables().is_empty());
        assert_eq!(load.result(), Some(VarId(2)));
    }

    #[test]
    fn test_rename_leaves_slots_alone() {
        let map = |v: VarId| (v == VarId(0)).then_some(VarId(9));
        let mut store = Instr::StoreBinding {
            slot: VarId(0),
            value: Operand::Var(VarId(0)),
        };
        store.rename_vars(&map);
        assert_eq!(
            store,
            Instr::StoreBinding {
                slot: VarId(0),
                value: Operand::Var(VarId(9)),
            }
        );

        let mut copy = Instr::copy(VarId(0), VarId(0));
        copy.rename_vars(&map);
        assert_eq!(copy, Instr::copy(VarId(9), VarId(9)));

        let mut load = Instr::LoadBinding {
            dst: VarId(0),
            slot: VarId(0),
        };
        load.rename_vars(&map);
        assert_eq!(
            load,
            Instr::LoadBinding {
                dst: VarId(9),
                slot: VarId(0),
            }
        );
    }

    #[test]
    fn test_flags_and_removability() {
        assert!(Instr::copy(VarId(0), Operand::Nil).is_removable());
        let call = Instr::call(Some(VarId(0)), Operand::Nil, "foo", vec![]);
        assert!(call.can_raise() && call.has_side_effect());
        assert!(!call.is_removable());
        let ret = Instr::Return { value: Operand::Nil };
        assert!(ret.transfers_control());
        assert_eq!(ret.operation().to_string(), "return");
        assert_eq!(AluOp::FLt.result_type(), UnboxedType::Boolean);
        assert_eq!(AluOp::FAdd.result_type(), UnboxedType::Float);
        assert_eq!(AluOp::IShl.result_type(), UnboxedType::Fixnum);
    }

    #[test]
    fn test_sub_closure() {
        let call = Instr::Call(
            CallInstr::new(None, Operand::Nil, "each", vec![]).with_closure(Operand::Closure(ScopeId(3))),
        );
        assert_eq!(call.sub_closure(), Some(ScopeId(3)));
        let pass_through = Instr::Call(
            CallInstr::new(None, Operand::Nil, "each", vec![]).with_closure(Operand::Var(VarId(1))),
        );
        assert!(pass_through.accepts_closure());
        assert_eq!(pass_through.sub_closure(), None);
        assert_eq!(pass_through.used_variables(), vec![VarId(1)]);
    }
}
