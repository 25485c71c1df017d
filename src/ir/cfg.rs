//! Control-flow graph of one scope.
//!
//! Every CFG owns a synthesized, initially empty entry block and exit block. Edges carry an
//! [`EdgeKind`]; exception edges run from a protected block to the first block of its
//! handler and are what the analyses follow to model raising instructions. Blocks are never
//! removed, so [`BlockId`]s stay valid for the lifetime of the CFG.
//!
//! # Global Ensure Block
//!
//! Closures that keep local variables in registers need a last chance to flush them when an
//! exception escapes. [`Cfg::add_global_ensure_block`] wires a synthesized handler into
//! every block that has no handler of its own.

use strum::Display;

use crate::{
    ir::{BasicBlock, BlockFlags, BlockId, Instr},
    utils::graph::{self, Successors},
};

/// Classification of a CFG edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EdgeKind {
    /// Explicit jump or branch.
    Regular,
    /// Fall-through into the textually next block.
    FallThrough,
    /// From a protected block to its handler.
    Exception,
    /// Into the exit block.
    Exit,
}

/// A directed CFG edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    /// Source block.
    pub source: BlockId,
    /// Target block.
    pub target: BlockId,
    /// Edge classification.
    pub kind: EdgeKind,
}

/// A scope's control-flow graph.
#[derive(Debug, Clone)]
pub struct Cfg {
    blocks: Vec<BasicBlock>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
    rescuers: Vec<Option<BlockId>>,
    entry: BlockId,
    exit: BlockId,
    global_ensure: Option<BlockId>,
}

impl Default for Cfg {
    fn default() -> Self {
        Self::new()
    }
}

impl Cfg {
    /// Creates a CFG containing only the entry and exit blocks.
    #[must_use]
    pub fn new() -> Self {
        let mut cfg = Self {
            blocks: Vec::new(),
            edges: Vec::new(),
            outgoing: Vec::new(),
            incoming: Vec::new(),
            rescuers: Vec::new(),
            entry: BlockId(0),
            exit: BlockId(1),
            global_ensure: None,
        };
        cfg.entry = cfg.push_block("entry", BlockFlags::ENTRY);
        cfg.exit = cfg.push_block("exit", BlockFlags::EXIT);
        cfg
    }

    fn push_block(&mut self, label: &str, flags: BlockFlags) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(BasicBlock {
            id,
            label: label.to_string(),
            instrs: Vec::new(),
            flags,
        });
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        self.rescuers.push(None);
        id
    }

    /// Adds an empty ordinary block.
    pub fn add_block(&mut self, label: &str) -> BlockId {
        self.push_block(label, BlockFlags::empty())
    }

    /// Returns the entry block.
    #[must_use]
    pub const fn entry(&self) -> BlockId {
        self.entry
    }

    /// Returns the exit block.
    #[must_use]
    pub const fn exit(&self) -> BlockId {
        self.exit
    }

    /// Returns the number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Returns a block by handle.
    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.0)
    }

    /// Returns a block by handle, mutably.
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(id.0)
    }

    /// Iterates over every block in creation order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    /// Iterates over every block handle in creation order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len()).map(BlockId)
    }

    /// Returns the instructions of a block; empty for an unknown handle.
    #[must_use]
    pub fn instructions(&self, id: BlockId) -> &[Instr] {
        self.blocks.get(id.0).map_or(&[], |b| b.instrs.as_slice())
    }

    /// Total instruction count over all blocks.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// Appends an instruction to a block. Unknown handles are ignored.
    pub fn push(&mut self, id: BlockId, instr: Instr) {
        if let Some(block) = self.blocks.get_mut(id.0) {
            block.instrs.push(instr);
        }
    }

    /// Swaps in a rewritten instruction list, returning the old one.
    pub fn replace_instructions(&mut self, id: BlockId, instrs: Vec<Instr>) -> Option<Vec<Instr>> {
        self.blocks
            .get_mut(id.0)
            .map(|b| std::mem::replace(&mut b.instrs, instrs))
    }

    /// Adds a directed edge.
    pub fn add_edge(&mut self, source: BlockId, target: BlockId, kind: EdgeKind) {
        let index = self.edges.len();
        self.edges.push(Edge {
            source,
            target,
            kind,
        });
        self.outgoing[source.0].push(index);
        self.incoming[target.0].push(index);
    }

    /// Declares `rescuer` as the handler of `block`.
    ///
    /// Marks `rescuer` as a rescue entry and adds the exception edge.
    pub fn set_rescuer(&mut self, block: BlockId, rescuer: BlockId) {
        self.rescuers[block.0] = Some(rescuer);
        self.blocks[rescuer.0].flags |= BlockFlags::RESCUE_ENTRY;
        self.add_edge(block, rescuer, EdgeKind::Exception);
    }

    /// Returns the first block of the handler protecting `block`.
    #[must_use]
    pub fn rescuer(&self, block: BlockId) -> Option<BlockId> {
        self.rescuers.get(block.0).copied().flatten()
    }

    /// Returns `true` if `block` is protected by some handler.
    #[must_use]
    pub fn is_protected(&self, block: BlockId) -> bool {
        self.rescuer(block).is_some()
    }

    /// Returns `true` if `block` is a rescue entry.
    #[must_use]
    pub fn is_rescue_entry(&self, block: BlockId) -> bool {
        self.block(block).is_some_and(BasicBlock::is_rescue_entry)
    }

    /// Outgoing edges of `block`, in insertion order.
    pub fn outgoing_edges(&self, block: BlockId) -> impl Iterator<Item = &Edge> + '_ {
        self.outgoing
            .get(block.0)
            .into_iter()
            .flatten()
            .map(|&e| &self.edges[e])
    }

    /// Incoming edges of `block`, in insertion order.
    pub fn incoming_edges(&self, block: BlockId) -> impl Iterator<Item = &Edge> + '_ {
        self.incoming
            .get(block.0)
            .into_iter()
            .flatten()
            .map(|&e| &self.edges[e])
    }

    /// Direct successors of `block`.
    pub fn successors_of(&self, block: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.outgoing_edges(block).map(|e| e.target)
    }

    /// Direct predecessors of `block`.
    pub fn predecessors_of(&self, block: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.incoming_edges(block).map(|e| e.source)
    }

    /// Blocks reachable from entry, in postorder.
    #[must_use]
    pub fn postorder(&self) -> Vec<BlockId> {
        graph::postorder(self, self.entry)
    }

    /// Blocks reachable from entry, in reverse postorder.
    #[must_use]
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        graph::reverse_postorder(self, self.entry)
    }

    /// Reachability from entry, indexed by block index.
    #[must_use]
    pub fn reachable(&self) -> Vec<bool> {
        graph::reachable(self, self.entry)
    }

    /// Returns the synthesized global ensure block, if one was added.
    #[must_use]
    pub const fn global_ensure_block(&self) -> Option<BlockId> {
        self.global_ensure
    }

    /// Adds the global ensure block with the given body.
    ///
    /// The block exits to the exit block and becomes the handler of every block that is
    /// neither protected nor the exit block. Returns `None` if the CFG already has one.
    pub fn add_global_ensure_block(&mut self, instrs: Vec<Instr>) -> Option<BlockId> {
        if self.global_ensure.is_some() {
            return None;
        }
        let geb = self.push_block("global_ensure", BlockFlags::GLOBAL_ENSURE);
        self.blocks[geb.0].instrs = instrs;
        self.global_ensure = Some(geb);
        self.add_edge(geb, self.exit, EdgeKind::Exit);

        let unprotected: Vec<BlockId> = self
            .block_ids()
            .filter(|&b| b != geb && b != self.exit && !self.is_protected(b))
            .collect();
        for block in unprotected {
            self.set_rescuer(block, geb);
        }
        Some(geb)
    }
}

impl Successors for Cfg {
    type Node = BlockId;

    fn node_count(&self) -> usize {
        self.blocks.len()
    }

    fn successors(&self, node: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.successors_of(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Operand;

    fn diamond() -> (Cfg, [BlockId; 4]) {
        let mut cfg = Cfg::new();
        let a = cfg.add_block("a");
        let b = cfg.add_block("b");
        let c = cfg.add_block("c");
        let d = cfg.add_block("d");
        cfg.add_edge(cfg.entry(), a, EdgeKind::FallThrough);
        cfg.add_edge(a, b, EdgeKind::Regular);
        cfg.add_edge(a, c, EdgeKind::FallThrough);
        cfg.add_edge(b, d, EdgeKind::Regular);
        cfg.add_edge(c, d, EdgeKind::FallThrough);
        cfg.add_edge(d, cfg.exit(), EdgeKind::Exit);
        (cfg, [a, b, c, d])
    }

    #[test]
    fn test_new_cfg_has_entry_and_exit() {
        let cfg = Cfg::new();
        assert_eq!(cfg.block_count(), 2);
        assert!(cfg.block(cfg.entry()).is_some_and(BasicBlock::is_entry));
        assert!(cfg.block(cfg.exit()).is_some_and(BasicBlock::is_exit));
    }

    #[test]
    fn test_orders_cover_reachable_blocks() {
        let (mut cfg, [a, _, _, d]) = diamond();
        let orphan = cfg.add_block("orphan");
        let rpo = cfg.reverse_postorder();
        assert_eq!(rpo.first(), Some(&cfg.entry()));
        assert_eq!(rpo.last(), Some(&cfg.exit()));
        assert_eq!(rpo.len(), 6);
        assert!(!rpo.contains(&orphan));
        let pos = |b| rpo.iter().position(|&x| x == b);
        assert!(pos(a) < pos(d));
        assert!(!cfg.reachable()[orphan.index()]);
    }

    #[test]
    fn test_rescuer_marks_handler() {
        let (mut cfg, [a, b, _, _]) = diamond();
        let handler = cfg.add_block("rescue");
        cfg.set_rescuer(b, handler);
        assert_eq!(cfg.rescuer(b), Some(handler));
        assert!(!cfg.is_protected(a));
        assert!(cfg.is_rescue_entry(handler));
        assert!(cfg
            .outgoing_edges(b)
            .any(|e| e.target == handler && e.kind == EdgeKind::Exception));
    }

    #[test]
    fn test_global_ensure_protects_unprotected_blocks() {
        let (mut cfg, [a, b, c, d]) = diamond();
        let handler = cfg.add_block("rescue");
        cfg.set_rescuer(b, handler);
        cfg.add_edge(handler, d, EdgeKind::Regular);

        let geb = cfg
            .add_global_ensure_block(vec![Instr::Raise { value: Operand::Nil }])
            .expect("first global ensure block");
        assert_eq!(cfg.global_ensure_block(), Some(geb));
        assert_eq!(cfg.rescuer(b), Some(handler));
        for block in [cfg.entry(), a, c, d, handler] {
            assert_eq!(cfg.rescuer(block), Some(geb), "{block} should be protected");
        }
        assert_eq!(cfg.rescuer(cfg.exit()), None);
        assert!(cfg.successors_of(geb).any(|s| s == cfg.exit()));
        assert!(cfg.add_global_ensure_block(Vec::new()).is_none());
    }
}
