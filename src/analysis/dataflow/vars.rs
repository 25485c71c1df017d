//! Dense numbering of the variables a problem tracks.

use std::collections::HashMap;

use crate::{ir::VarId, utils::BitSet, Error, Result};

/// Maps variables to dense bit positions.
///
/// Indices are handed out in discovery order and never reassigned, so a [`BitSet`] built
/// against the index stays meaningful for the lifetime of the problem.
#[derive(Debug, Clone, Default)]
pub struct DataFlowVarIndex {
    problem: &'static str,
    positions: HashMap<VarId, usize>,
    vars: Vec<VarId>,
}

impl DataFlowVarIndex {
    /// Creates an empty index owned by the named problem.
    #[must_use]
    pub fn new(problem: &'static str) -> Self {
        Self {
            problem,
            positions: HashMap::new(),
            vars: Vec::new(),
        }
    }

    /// Returns the position of `var`, assigning the next free one on first sight.
    pub fn add(&mut self, var: VarId) -> usize {
        let next = self.vars.len();
        *self.positions.entry(var).or_insert_with(|| {
            self.vars.push(var);
            next
        })
    }

    /// Returns the position of `var` if it was registered.
    #[must_use]
    pub fn get(&self, var: VarId) -> Option<usize> {
        self.positions.get(&var).copied()
    }

    /// Returns the position of `var`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingDataflowVar`] if `var` was never registered.
    pub fn position(&self, var: VarId) -> Result<usize> {
        self.get(var).ok_or(Error::MissingDataflowVar {
            problem: self.problem,
            var,
        })
    }

    /// Returns the variable at `position`.
    #[must_use]
    pub fn var(&self, position: usize) -> Option<VarId> {
        self.vars.get(position).copied()
    }

    /// Number of registered variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns `true` if nothing was registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Registered variables in position order.
    pub fn iter(&self) -> impl Iterator<Item = VarId> + '_ {
        self.vars.iter().copied()
    }

    /// An empty bit set sized for this index.
    #[must_use]
    pub fn empty_set(&self) -> BitSet {
        BitSet::new(self.len())
    }

    /// Decodes a bit set into the variables it contains.
    pub fn decode<'a>(&'a self, set: &'a BitSet) -> impl Iterator<Item = VarId> + 'a {
        set.iter().filter_map(|i| self.var(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_are_stable() {
        let mut index = DataFlowVarIndex::new("test");
        assert_eq!(index.add(VarId(7)), 0);
        assert_eq!(index.add(VarId(3)), 1);
        assert_eq!(index.add(VarId(7)), 0);
        assert_eq!(index.len(), 2);
        assert_eq!(index.var(1), Some(VarId(3)));
        assert_eq!(index.iter().collect::<Vec<_>>(), vec![VarId(7), VarId(3)]);
    }

    #[test]
    fn test_missing_var_is_an_error() {
        let index = DataFlowVarIndex::new("test");
        assert!(matches!(
            index.position(VarId(1)),
            Err(Error::MissingDataflowVar { problem: "test", .. })
        ));
    }
}
