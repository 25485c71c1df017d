//! Scopes and the tree that owns them.
//!
//! A [`ScopeTree`] is an arena: methods and scripts are roots, closures hang off
//! the scope they are written in. The tree also owns the [`VariableTable`] so that
//! temporaries can be minted while any scope's CFG is being rewritten.

use std::{collections::BTreeSet, fmt};

use strum::Display;

use crate::{
    ir::{BindingSlot, BlockId, Cfg, Instr, UnboxedType, VarId, Variable, VariableTable},
    Error, Result,
};

/// Handle to a scope in a [`ScopeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub(crate) usize);

impl ScopeId {
    /// Returns the raw index of this handle.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// What kind of code a scope holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ScopeKind {
    /// A method body.
    Method,
    /// A block or lambda body nested in another scope.
    Closure,
    /// A top-level script body.
    Script,
}

/// A method, script or closure body.
#[derive(Debug, Clone)]
pub struct Scope {
    /// This scope's handle.
    pub id: ScopeId,
    /// Name, used only in diagnostics.
    pub name: String,
    /// Kind of code held.
    pub kind: ScopeKind,
    /// Lexically enclosing scope; `None` for roots.
    pub parent: Option<ScopeId>,
    /// Closures written directly inside this scope.
    pub closures: Vec<ScopeId>,
    /// Control-flow graph of the body.
    pub cfg: Cfg,
    /// The closure shares its parent's dynamic scope rather than allocating its own.
    pub reuses_parent_dynscope: bool,
    binding_escaped: bool,
}

impl Scope {
    /// Returns `true` for closures.
    #[must_use]
    pub fn is_closure(&self) -> bool {
        self.kind == ScopeKind::Closure
    }

    /// Returns `true` if the binding may be observed by code the compiler cannot see.
    #[must_use]
    pub fn binding_has_escaped(&self) -> bool {
        self.binding_escaped
    }

    /// Depth beyond which a local is owned by an enclosing scope and always defined.
    #[must_use]
    pub fn parent_scope_depth(&self) -> usize {
        usize::from(self.reuses_parent_dynscope)
    }
}

/// Use and definition summary of a scope's locals, by binding slot.
///
/// Includes everything the scope's nested closures read or write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalUsage {
    /// Slots read anywhere in the scope or its closures.
    pub used: BTreeSet<BindingSlot>,
    /// Slots written anywhere in the scope or its closures.
    pub defined: BTreeSet<BindingSlot>,
}

impl LocalUsage {
    /// Returns `true` if `slot` is read or written.
    #[must_use]
    pub fn touches(&self, slot: &BindingSlot) -> bool {
        self.used.contains(slot) || self.defined.contains(slot)
    }
}

/// Arena of scopes sharing one variable table.
#[derive(Debug, Clone, Default)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
    vars: VariableTable,
}

impl ScopeTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push_scope(&mut self, name: &str, kind: ScopeKind, parent: Option<ScopeId>) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope {
            id,
            name: name.to_string(),
            kind,
            parent,
            closures: Vec::new(),
            cfg: Cfg::new(),
            reuses_parent_dynscope: false,
            binding_escaped: false,
        });
        id
    }

    /// Adds a root method scope.
    pub fn add_method(&mut self, name: &str) -> ScopeId {
        self.push_scope(name, ScopeKind::Method, None)
    }

    /// Adds a root script scope.
    pub fn add_script(&mut self, name: &str) -> ScopeId {
        self.push_scope(name, ScopeKind::Script, None)
    }

    /// Adds a closure nested directly in `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`] if `parent` is not part of this tree.
    pub fn add_closure(&mut self, parent: ScopeId, name: &str) -> Result<ScopeId> {
        self.scope(parent)?;
        let id = self.push_scope(name, ScopeKind::Closure, Some(parent));
        self.scopes[parent.0].closures.push(id);
        Ok(id)
    }

    /// Number of scopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Returns `true` if the tree holds no scope.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Returns a scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`] for a foreign handle.
    pub fn scope(&self, id: ScopeId) -> Result<&Scope> {
        self.scopes.get(id.0).ok_or(Error::UnknownScope(id))
    }

    /// Returns a scope, mutably.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`] for a foreign handle.
    pub fn scope_mut(&mut self, id: ScopeId) -> Result<&mut Scope> {
        self.scopes.get_mut(id.0).ok_or(Error::UnknownScope(id))
    }

    /// Returns a scope's CFG.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`] for a foreign handle.
    pub fn cfg(&self, id: ScopeId) -> Result<&Cfg> {
        Ok(&self.scope(id)?.cfg)
    }

    /// Returns a scope's CFG, mutably.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`] for a foreign handle.
    pub fn cfg_mut(&mut self, id: ScopeId) -> Result<&mut Cfg> {
        Ok(&mut self.scope_mut(id)?.cfg)
    }

    /// Root scopes, in creation order.
    pub fn roots(&self) -> impl Iterator<Item = ScopeId> + '_ {
        self.scopes
            .iter()
            .filter(|s| s.parent.is_none())
            .map(|s| s.id)
    }

    /// `root` followed by all of its nested closures, parents before children.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`] for a foreign handle.
    pub fn preorder(&self, root: ScopeId) -> Result<Vec<ScopeId>> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.scope(id)?.closures.iter().rev());
        }
        Ok(order)
    }

    /// The shared variable table.
    #[must_use]
    pub fn vars(&self) -> &VariableTable {
        &self.vars
    }

    /// Looks up a variable.
    #[must_use]
    pub fn variable(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(id)
    }

    /// Marks `scope`'s binding as escaped. The flag is never cleared.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`] for a foreign handle.
    pub fn mark_binding_escaped(&mut self, scope: ScopeId) -> Result<()> {
        self.scope_mut(scope)?.binding_escaped = true;
        Ok(())
    }

    /// Returns the local `name` as seen from `scope` at `depth`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`] if `scope` is foreign, or [`Error::Internal`] if
    /// `depth` reaches past the root of the tree.
    pub fn local(&mut self, scope: ScopeId, name: &str, depth: usize) -> Result<VarId> {
        if let Some(id) = self.vars.lookup_local(scope, name, depth) {
            return Ok(id);
        }
        let mut owner = scope;
        for _ in 0..depth {
            owner = self.scope(owner)?.parent.ok_or_else(|| {
                internal_error!("local {} at depth {} escapes the root of {}", name, depth, scope)
            })?;
        }
        let closure_binding = self.scope(owner)?.is_closure();
        let slot = BindingSlot {
            scope: owner,
            name: name.to_string(),
        };
        Ok(self
            .vars
            .intern_local(scope, name, depth, slot, closure_binding))
    }

    /// Mints a fresh boxed temporary owned by `scope`.
    pub fn new_temporary(&mut self, scope: ScopeId) -> VarId {
        self.vars.new_temporary(scope, None)
    }

    /// Mints a fresh unboxed scratch variable owned by `scope`.
    pub fn new_unboxed_temporary(&mut self, scope: ScopeId, kind: UnboxedType) -> VarId {
        self.vars.new_temporary(scope, Some(kind))
    }

    /// The `self` pseudo-variable of `scope`.
    pub fn self_var(&mut self, scope: ScopeId) -> VarId {
        self.vars.pseudo(scope, true)
    }

    /// The block-argument pseudo-variable of `scope`.
    pub fn block_var(&mut self, scope: ScopeId) -> VarId {
        self.vars.pseudo(scope, false)
    }

    /// Returns the binding slot of a local.
    #[must_use]
    pub fn slot(&self, var: VarId) -> Option<&BindingSlot> {
        self.vars.slot(var)
    }

    /// Translates a local of `from` into the variable `to` uses for the same slot.
    ///
    /// Only existing variables are returned; `None` means `to` never refers to the slot.
    #[must_use]
    pub fn translate_local(&self, var: VarId, from: ScopeId, to: ScopeId) -> Option<VarId> {
        let depth = self.variable(var)?.depth()?;
        let name = self.variable(var)?.name()?;
        let target_depth = if self.is_ancestor(from, to) {
            depth + self.distance(to, from)?
        } else {
            depth.checked_sub(self.distance(from, to)?)?
        };
        let candidate = self.vars.lookup_local(to, name, target_depth)?;
        (self.slot(candidate) == self.slot(var)).then_some(candidate)
    }

    /// Returns `true` if `ancestor` encloses `scope` (strictly).
    #[must_use]
    pub fn is_ancestor(&self, ancestor: ScopeId, scope: ScopeId) -> bool {
        self.distance(scope, ancestor).is_some_and(|d| d > 0)
    }

    /// Number of parent links from `scope` up to `ancestor`.
    fn distance(&self, scope: ScopeId, ancestor: ScopeId) -> Option<usize> {
        let mut current = scope;
        let mut steps = 0;
        loop {
            if current == ancestor {
                return Some(steps);
            }
            current = self.scopes.get(current.0)?.parent?;
            steps += 1;
        }
    }

    /// Local-variable use/def summary of `scope`, including nested closures.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownScope`] for a foreign handle.
    pub fn local_usage(&self, scope: ScopeId) -> Result<LocalUsage> {
        let mut usage = LocalUsage::default();
        for id in self.preorder(scope)? {
            for block in self.cfg(id)?.blocks() {
                for instr in &block.instrs {
                    for var in instr.used_variables() {
                        if let Some(slot) = self.slot(var) {
                            usage.used.insert(slot.clone());
                        }
                    }
                    if let Instr::StoreBinding { slot, .. } = instr {
                        if let Some(slot) = self.slot(*slot) {
                            usage.defined.insert(slot.clone());
                        }
                    }
                    if let Some(slot) = instr.result().and_then(|v| self.slot(v)) {
                        usage.defined.insert(slot.clone());
                    }
                }
            }
        }
        Ok(usage)
    }

    /// Adds the global ensure block to `scope`'s CFG.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GlobalEnsureExists`] if the CFG already has one.
    pub fn add_global_ensure_block(&mut self, scope: ScopeId, instrs: Vec<Instr>) -> Result<BlockId> {
        self.cfg_mut(scope)?
            .add_global_ensure_block(instrs)
            .ok_or(Error::GlobalEnsureExists(scope))
    }
}
