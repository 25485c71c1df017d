//! Abstract state of the unboxing analysis.

use std::collections::{BTreeMap, BTreeSet};

use strum::Display;

use crate::{
    ir::{Operand, UnboxedType, VarId, VariableTable},
    Error, Result,
};

/// Inferred type of a value. An absent entry is "unknown yet", the lattice top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ValueType {
    /// Always a fixnum
    Fixnum,
    /// Always a float
    Float,
    /// Always a boolean
    Boolean,
    /// Anything; the lattice bottom
    Object,
}

impl ValueType {
    /// The unboxed representation arithmetic on this type runs in.
    #[must_use]
    pub fn arithmetic(self) -> Option<UnboxedType> {
        match self {
            Self::Fixnum => Some(UnboxedType::Fixnum),
            Self::Float => Some(UnboxedType::Float),
            Self::Boolean | Self::Object => None,
        }
    }
}

impl From<UnboxedType> for ValueType {
    fn from(kind: UnboxedType) -> Self {
        match kind {
            UnboxedType::Fixnum => Self::Fixnum,
            UnboxedType::Float => Self::Float,
            UnboxedType::Boolean => Self::Boolean,
        }
    }
}

/// Per-program-point knowledge about types and unboxed copies.
///
/// `dirty` holds the variables whose unboxed copy is newer than their boxed value: the
/// boxed form must be rebuilt before anything reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnboxState {
    /// Known types.
    pub types: BTreeMap<VarId, ValueType>,
    /// Variables available in unboxed form, with their representation.
    pub unboxed: BTreeMap<VarId, UnboxedType>,
    /// Unboxed variables whose boxed form is stale.
    pub dirty: BTreeSet<VarId>,
}

impl UnboxState {
    /// Type of an operand at this point; `None` for a variable with no known type yet.
    ///
    /// Unboxed constants only appear in rewritten code and are typed as objects, so a
    /// rewritten instruction is never unboxed twice.
    #[must_use]
    pub fn operand_type(&self, operand: &Operand) -> Option<ValueType> {
        match operand {
            Operand::Fixnum(_) => Some(ValueType::Fixnum),
            Operand::Float(_) => Some(ValueType::Float),
            Operand::Boolean(_) => Some(ValueType::Boolean),
            Operand::Var(v) => self.types.get(v).copied(),
            _ => Some(ValueType::Object),
        }
    }

    /// Records the type of `var`; `None` leaves the state untouched.
    pub fn set_type(&mut self, var: Option<VarId>, ty: Option<ValueType>) {
        if let (Some(var), Some(ty)) = (var, ty) {
            self.types.insert(var, ty);
        }
    }

    /// Meets the types of `other` into `self`.
    ///
    /// An unknown type takes the other side's; two different types fall to
    /// [`ValueType::Object`].
    pub fn meet_types(&mut self, other: &Self) {
        self.meet_types_where(other, |_| true);
    }

    /// Meets only the types of variables accepted by `filter`.
    pub fn meet_types_where(&mut self, other: &Self, filter: impl Fn(VarId) -> bool) {
        for (&var, &ty) in &other.types {
            if !filter(var) {
                continue;
            }
            match self.types.get(&var) {
                None => {
                    self.types.insert(var, ty);
                }
                Some(&mine) if mine != ty => {
                    self.types.insert(var, ValueType::Object);
                }
                Some(_) => {}
            }
        }
    }

    /// Meets unboxed availability.
    ///
    /// A variable unboxed along only one path stays available; one unboxed with different
    /// representations on different paths does not.
    pub fn meet_unboxed(&mut self, other: &Self) {
        for (&var, &kind) in &other.unboxed {
            match self.unboxed.get(&var) {
                None => {
                    self.unboxed.insert(var, kind);
                }
                Some(&mine) if mine != kind => {
                    self.unboxed.remove(&var);
                }
                Some(_) => {}
            }
        }
    }

    /// Full meet: types, unboxed availability, and the union of dirty sets.
    pub fn meet(&mut self, other: &Self) {
        self.meet_types(other);
        self.meet_unboxed(other);
        self.dirty.extend(other.dirty.iter().copied());
    }

    /// Records that `var` was just computed in unboxed form.
    pub fn define_unboxed(&mut self, var: VarId, kind: UnboxedType) {
        self.unboxed.insert(var, kind);
        self.dirty.insert(var);
    }

    /// Drops dirty marks of variables no longer available unboxed.
    ///
    /// Happens at joins whose predecessors disagree on a representation; those
    /// predecessors box the variable before leaving.
    pub fn normalize(&mut self) {
        let unboxed = &self.unboxed;
        self.dirty.retain(|v| unboxed.contains_key(v));
    }

    /// Returns `true` if `var` enters a block as a dirty unboxed value.
    #[must_use]
    pub fn is_dirty_unboxed(&self, var: VarId) -> bool {
        self.dirty.contains(&var) && self.unboxed.contains_key(&var)
    }

    /// Settles an instruction that runs in boxed form.
    ///
    /// Returns the variables that must be boxed before it, in ascending order and with the
    /// representation they are boxed from, and updates the state for what happens after it.
    /// A barrier additionally forgets every unboxed local.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingUnboxedVar`] for a dirty variable with no representation.
    pub(crate) fn settle_boxed(
        &mut self,
        vars: &VariableTable,
        effects: &BoxedEffects<'_>,
    ) -> Result<Vec<(VarId, UnboxedType)>> {
        let mut to_box = BTreeSet::new();
        let local = |v: &VarId| vars.is_local(*v);

        if effects.may_raise {
            if effects.has_rescuer {
                to_box.extend(self.dirty.iter().copied());
            } else if effects.in_closure {
                to_box.extend(self.dirty.iter().copied().filter(local));
            }
        }
        if effects.in_closure && effects.leaves_scope {
            to_box.extend(self.dirty.iter().copied().filter(local));
        }
        if effects.barrier {
            to_box.extend(self.dirty.iter().copied().filter(local));
        }
        if !effects.reads_unboxed {
            to_box.extend(effects.used.iter().copied().filter(|v| self.dirty.contains(v)));
        }

        let mut boxed = Vec::with_capacity(to_box.len());
        for var in to_box {
            let kind = self
                .unboxed
                .get(&var)
                .copied()
                .ok_or(Error::MissingUnboxedVar(var))?;
            self.dirty.remove(&var);
            boxed.push((var, kind));
        }
        if effects.barrier {
            self.unboxed.retain(|v, _| !vars.is_local(*v));
        }
        if let Some(dst) = effects.dst {
            self.unboxed.remove(&dst);
            self.dirty.remove(&dst);
        }
        Ok(boxed)
    }
}

/// What an instruction running in boxed form implies for unboxed values.
pub(crate) struct BoxedEffects<'a> {
    pub dst: Option<VarId>,
    pub used: &'a [VarId],
    pub may_raise: bool,
    pub has_rescuer: bool,
    pub in_closure: bool,
    pub leaves_scope: bool,
    pub barrier: bool,
    /// Branches read their operand in unboxed form and need no boxing.
    pub reads_unboxed: bool,
}
