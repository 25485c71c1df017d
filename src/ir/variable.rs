//! Variables and the arena that owns them.
//!
//! Instructions never hold variables by value: they carry [`VarId`] handles into the
//! tree-wide [`VariableTable`]. Two handles are the same variable exactly when they are
//! equal, so within one scope identity already encodes the (name, depth) pair.
//!
//! Local variables additionally resolve to a [`BindingSlot`], the heap binding cell they
//! live in: the ancestor scope `depth` levels up, plus the name. The closure `{ sum += x }`
//! refers to its parent's `sum` as `(sum, depth 1)`, a different `VarId` from the parent's
//! `(sum, depth 0)`, but both resolve to the same slot. Cross-scope questions are answered
//! by comparing slots.

use std::{collections::HashMap, fmt};

use strum::{Display, EnumIter};

use crate::ir::ScopeId;

/// Handle to a variable in a [`VariableTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) usize);

impl VarId {
    /// Returns the raw index of this handle.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Machine representation of an unboxed scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum UnboxedType {
    /// 64-bit signed integer
    Fixnum,
    /// 64-bit IEEE float
    Float,
    /// Native boolean
    Boolean,
}

/// The different kinds of variable the analyses distinguish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableKind {
    /// A local whose binding cell belongs to a method or script scope.
    Local {
        /// Source name
        name: String,
        /// Number of scope levels between the reference and the binding
        depth: usize,
    },
    /// A local whose binding cell belongs to a closure scope.
    ClosureLocal {
        /// Source name
        name: String,
        /// Number of scope levels between the reference and the binding
        depth: usize,
        /// The closure that owns the binding cell
        defining_scope: ScopeId,
    },
    /// A compiler temporary, never stored in a binding.
    Temporary {
        /// Scope-local sequence number
        index: usize,
        /// Unboxed representation, or `None` for an ordinary boxed temporary
        unboxed: Option<UnboxedType>,
    },
    /// The `self` pseudo-variable.
    SelfValue,
    /// The implicit block-argument pseudo-variable.
    Block,
}

/// A variable as stored in the [`VariableTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    /// What kind of variable this is.
    pub kind: VariableKind,
    /// The scope whose instructions refer to this variable.
    pub owner: ScopeId,
}

impl Variable {
    /// Returns `true` for ordinary and closure locals.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(
            self.kind,
            VariableKind::Local { .. } | VariableKind::ClosureLocal { .. }
        )
    }

    /// Returns `true` for the `self` pseudo-variable.
    #[must_use]
    pub fn is_self(&self) -> bool {
        matches!(self.kind, VariableKind::SelfValue)
    }

    /// Returns `true` for temporaries, boxed or unboxed.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(self.kind, VariableKind::Temporary { .. })
    }

    /// Returns the source name of a local.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            VariableKind::Local { name, .. } | VariableKind::ClosureLocal { name, .. } => {
                Some(name)
            }
            _ => None,
        }
    }

    /// Returns the scope depth of a local.
    #[must_use]
    pub fn depth(&self) -> Option<usize> {
        match self.kind {
            VariableKind::Local { depth, .. } | VariableKind::ClosureLocal { depth, .. } => {
                Some(depth)
            }
            _ => None,
        }
    }

    /// Returns the unboxed representation of an unboxed temporary.
    #[must_use]
    pub fn unboxed_type(&self) -> Option<UnboxedType> {
        match self.kind {
            VariableKind::Temporary { unboxed, .. } => unboxed,
            _ => None,
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            VariableKind::Local { name, depth } | VariableKind::ClosureLocal { name, depth, .. } => {
                if *depth == 0 {
                    write!(f, "{name}")
                } else {
                    write!(f, "{name}^{depth}")
                }
            }
            VariableKind::Temporary { index, unboxed } => match unboxed {
                None => write!(f, "%t{index}"),
                Some(UnboxedType::Fixnum) => write!(f, "%i{index}"),
                Some(UnboxedType::Float) => write!(f, "%f{index}"),
                Some(UnboxedType::Boolean) => write!(f, "%b{index}"),
            },
            VariableKind::SelfValue => f.write_str("%self"),
            VariableKind::Block => f.write_str("%block"),
        }
    }
}

/// The binding cell a local variable lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingSlot {
    /// The scope that owns the binding.
    pub scope: ScopeId,
    /// Variable name within that binding.
    pub name: String,
}

/// Arena of every variable in a scope tree.
///
/// Locals are interned per (owner, name, depth); temporaries are minted fresh by the
/// owning scope's factory methods on [`ScopeTree`](crate::ir::ScopeTree).
#[derive(Debug, Default, Clone)]
pub struct VariableTable {
    vars: Vec<Variable>,
    slots: Vec<Option<BindingSlot>>,
    locals: HashMap<(ScopeId, String, usize), VarId>,
    pseudo: HashMap<(ScopeId, bool), VarId>,
    temp_counters: HashMap<ScopeId, usize>,
}

impl VariableTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns `true` if no variable was ever created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Returns the variable behind a handle.
    #[must_use]
    pub fn get(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(id.0)
    }

    /// Returns `true` if `id` names a local (ordinary or closure).
    #[must_use]
    pub fn is_local(&self, id: VarId) -> bool {
        self.get(id).is_some_and(Variable::is_local)
    }

    /// Returns `true` if `id` names `self`.
    #[must_use]
    pub fn is_self(&self, id: VarId) -> bool {
        self.get(id).is_some_and(Variable::is_self)
    }

    /// Returns the binding slot of a local.
    #[must_use]
    pub fn slot(&self, id: VarId) -> Option<&BindingSlot> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Looks up an interned local without creating it.
    #[must_use]
    pub fn lookup_local(&self, owner: ScopeId, name: &str, depth: usize) -> Option<VarId> {
        self.locals.get(&(owner, name.to_string(), depth)).copied()
    }

    /// Returns every variable owned by `scope`, in creation order.
    pub fn owned_by(&self, scope: ScopeId) -> impl Iterator<Item = VarId> + '_ {
        self.vars
            .iter()
            .enumerate()
            .filter(move |(_, v)| v.owner == scope)
            .map(|(i, _)| VarId(i))
    }

    pub(crate) fn intern_local(
        &mut self,
        owner: ScopeId,
        name: &str,
        depth: usize,
        slot: BindingSlot,
        closure_binding: bool,
    ) -> VarId {
        let key = (owner, name.to_string(), depth);
        if let Some(&id) = self.locals.get(&key) {
            return id;
        }
        let kind = if closure_binding {
            VariableKind::ClosureLocal {
                name: name.to_string(),
                depth,
                defining_scope: slot.scope,
            }
        } else {
            VariableKind::Local {
                name: name.to_string(),
                depth,
            }
        };
        let id = self.push(Variable { kind, owner }, Some(slot));
        self.locals.insert(key, id);
        id
    }

    pub(crate) fn new_temporary(&mut self, owner: ScopeId, unboxed: Option<UnboxedType>) -> VarId {
        let counter = self.temp_counters.entry(owner).or_insert(0);
        let index = *counter;
        *counter += 1;
        self.push(
            Variable {
                kind: VariableKind::Temporary { index, unboxed },
                owner,
            },
            None,
        )
    }

    pub(crate) fn pseudo(&mut self, owner: ScopeId, is_self: bool) -> VarId {
        if let Some(&id) = self.pseudo.get(&(owner, is_self)) {
            return id;
        }
        let kind = if is_self {
            VariableKind::SelfValue
        } else {
            VariableKind::Block
        };
        let id = self.push(Variable { kind, owner }, None);
        self.pseudo.insert((owner, is_self), id);
        id
    }

    fn push(&mut self, var: Variable, slot: Option<BindingSlot>) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(var);
        self.slots.push(slot);
        id
    }
}
