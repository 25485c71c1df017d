use std::fmt;

use bitflags::bitflags;

use crate::{ir::Instr, utils::graph::GraphNode};

/// Handle to a basic block within one [`Cfg`](crate::ir::Cfg).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    /// Returns the raw index of this handle.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl GraphNode for BlockId {
    fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// Structural role of a basic block
    pub struct BlockFlags: u8 {
        /// The unique entry block of the CFG
        const ENTRY = 0x01;
        /// The unique exit block of the CFG
        const EXIT = 0x02;
        /// First block of an exception handler
        const RESCUE_ENTRY = 0x04;
        /// The synthesized handler protecting every otherwise unprotected block
        const GLOBAL_ENSURE = 0x08;
    }
}

/// A straight-line sequence of instructions.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// This block's handle.
    pub id: BlockId,
    /// Human-readable label, used only in diagnostics.
    pub label: String,
    /// Instructions in execution order.
    pub instrs: Vec<Instr>,
    /// Structural role.
    pub flags: BlockFlags,
}

impl BasicBlock {
    /// Returns `true` for the CFG entry block.
    #[must_use]
    pub fn is_entry(&self) -> bool {
        self.flags.contains(BlockFlags::ENTRY)
    }

    /// Returns `true` for the CFG exit block.
    #[must_use]
    pub fn is_exit(&self) -> bool {
        self.flags.contains(BlockFlags::EXIT)
    }

    /// Returns `true` if the block starts an exception handler.
    #[must_use]
    pub fn is_rescue_entry(&self) -> bool {
        self.flags.contains(BlockFlags::RESCUE_ENTRY)
    }

    /// Returns the trailing control transfer, if the block ends with one.
    #[must_use]
    pub fn terminator(&self) -> Option<&Instr> {
        self.instrs.last().filter(|i| i.transfers_control())
    }
}
