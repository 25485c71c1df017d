//! IR construction helpers shared by the unit tests.

use crate::ir::{BlockId, Cfg, EdgeKind, Instr, ScopeTree, VarId};

// Helper function to add `labels` as a straight line entry -> labels... -> exit
pub(crate) fn link_chain<const N: usize>(cfg: &mut Cfg, labels: [&str; N]) -> [BlockId; N] {
    let blocks = labels.map(|label| cfg.add_block(label));
    let mut previous = cfg.entry();
    for &block in &blocks {
        cfg.add_edge(previous, block, EdgeKind::FallThrough);
        previous = block;
    }
    let exit = cfg.exit();
    cfg.add_edge(previous, exit, EdgeKind::Exit);
    blocks
}

// Helper function to list every instruction of a scope, in block order
pub(crate) fn instructions(tree: &ScopeTree, scope: crate::ir::ScopeId) -> Vec<Instr> {
    tree.cfg(scope)
        .map(|cfg| cfg.blocks().flat_map(|b| b.instrs.iter().cloned()).collect())
        .unwrap_or_default()
}

// Helper function to count the instructions of a scope that define `var`
pub(crate) fn definitions_of(tree: &ScopeTree, scope: crate::ir::ScopeId, var: VarId) -> usize {
    instructions(tree, scope)
        .iter()
        .filter(|i| i.result() == Some(var))
        .count()
}
