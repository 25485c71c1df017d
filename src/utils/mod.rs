//! Supporting data structures: a word-parallel [`BitSet`] and graph traversals.

mod bitset;
pub mod graph;

pub use bitset::{BitSet, BitSetIter};
