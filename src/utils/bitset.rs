//! A fixed-capacity bit vector used as the state of the bit-vector analyses.
//!
//! Liveness and defined-variable analysis publish one [`BitSet`] per block, indexed by
//! the problem's dataflow variable index. All set operations work a word (64 elements)
//! at a time and report whether the receiver changed, which is exactly what the
//! fixed-point engine needs to decide whether a block's solution moved.
//!
//! # Example
//!
//! ```rust
//! use scopeflow::utils::BitSet;
//!
//! let mut live = BitSet::new(70);
//! live.insert(3);
//! live.insert(65);
//!
//! let mut other = BitSet::new(70);
//! other.insert(65);
//! assert!(other.is_subset(&live));
//! assert!(!live.union_with(&other));
//! assert_eq!(live.iter().collect::<Vec<_>>(), vec![3, 65]);
//! ```

/// A bit vector over the indices `0..len`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BitSet {
    /// The bits, stored as a vector of words.
    words: Vec<u64>,
    /// The number of addressable bits.
    len: usize,
}

impl BitSet {
    /// Creates a new empty bit set with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            len: capacity,
        }
    }

    /// Creates a new bit set with all bits set.
    #[must_use]
    pub fn full(capacity: usize) -> Self {
        let mut set = Self::new(capacity);
        set.fill();
        set
    }

    /// Creates a bit set of the given capacity containing `indices`.
    ///
    /// # Panics
    ///
    /// Panics if any index is `>= capacity`.
    #[must_use]
    pub fn from_indices(capacity: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut set = Self::new(capacity);
        for index in indices {
            set.insert(index);
        }
        set
    }

    /// Returns the capacity of this bit set.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the bit set has no bits set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Sets the bit at the given index, returning `true` if it was previously clear.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn insert(&mut self, index: usize) -> bool {
        assert!(index < self.len, "index out of bounds");
        let mask = 1u64 << (index % 64);
        let word = &mut self.words[index / 64];
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    /// Clears the bit at the given index, returning `true` if it was previously set.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn remove(&mut self, index: usize) -> bool {
        assert!(index < self.len, "index out of bounds");
        let mask = 1u64 << (index % 64);
        let word = &mut self.words[index / 64];
        let was_set = *word & mask != 0;
        *word &= !mask;
        was_set
    }

    /// Returns `true` if the bit at the given index is set.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        assert!(index < self.len, "index out of bounds");
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Returns the number of bits set.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Clears all bits.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Sets all bits.
    pub fn fill(&mut self) {
        self.words.fill(u64::MAX);
        // Bits past `len` must stay clear so equality and counting stay exact
        if self.len % 64 != 0 {
            if let Some(last) = self.words.last_mut() {
                *last = (1u64 << (self.len % 64)) - 1;
            }
        }
    }

    /// Returns `true` if every bit set in `self` is also set in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        assert_eq!(self.len, other.len, "bit sets must have same length");
        self.words
            .iter()
            .zip(&other.words)
            .all(|(a, b)| a & !b == 0)
    }

    /// Computes the union with another bit set (in place).
    ///
    /// Returns `true` if `self` changed.
    pub fn union_with(&mut self, other: &Self) -> bool {
        self.combine(other, |a, b| a | b)
    }

    /// Computes the intersection with another bit set (in place).
    ///
    /// Returns `true` if `self` changed.
    pub fn intersect_with(&mut self, other: &Self) -> bool {
        self.combine(other, |a, b| a & b)
    }

    /// Removes all bits that are set in `other` from `self`.
    ///
    /// Returns `true` if `self` changed.
    pub fn difference_with(&mut self, other: &Self) -> bool {
        self.combine(other, |a, b| a & !b)
    }

    fn combine(&mut self, other: &Self, op: impl Fn(u64, u64) -> u64) -> bool {
        assert_eq!(self.len, other.len, "bit sets must have same length");
        let mut changed = false;
        for (a, &b) in self.words.iter_mut().zip(&other.words) {
            let old = *a;
            *a = op(old, b);
            changed |= old != *a;
        }
        changed
    }

    /// Returns an iterator over the indices of set bits, in increasing order.
    pub fn iter(&self) -> BitSetIter<'_> {
        BitSetIter {
            words: &self.words,
            word_idx: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }
}

impl std::fmt::Debug for BitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Iterator over the set bits in a [`BitSet`].
pub struct BitSetIter<'a> {
    words: &'a [u64],
    word_idx: usize,
    current: u64,
}

impl Iterator for BitSetIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.word_idx * 64 + bit);
            }
            self.word_idx += 1;
            self.current = *self.words.get(self.word_idx)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_insert_reports_novelty() {
        let mut bs = BitSet::new(100);
        assert!(bs.is_empty());
        assert!(bs.insert(50));
        assert!(!bs.insert(50));
        assert!(bs.remove(50));
        assert!(!bs.remove(50));
        assert!(bs.is_empty());
    }

    #[test]
    fn test_bitset_full_masks_tail() {
        let bs = BitSet::full(70);
        assert_eq!(bs.count(), 70);
        assert_eq!(bs, BitSet::from_indices(70, 0..70));
    }

    #[test]
    fn test_bitset_union_intersect() {
        let mut a = BitSet::from_indices(130, [0, 1, 128]);
        let b = BitSet::from_indices(130, [1, 2]);

        let mut u = a.clone();
        assert!(u.union_with(&b));
        assert_eq!(u.iter().collect::<Vec<_>>(), vec![0, 1, 2, 128]);
        assert!(!u.union_with(&b));

        assert!(a.intersect_with(&b));
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_bitset_difference() {
        let mut a = BitSet::from_indices(100, [0, 1, 2]);
        let b = BitSet::from_indices(100, [1]);
        assert!(a.difference_with(&b));
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 2]);
        assert!(!a.difference_with(&b));
    }

    #[test]
    fn test_bitset_subset() {
        let small = BitSet::from_indices(64, [3]);
        let big = BitSet::from_indices(64, [3, 63]);
        assert!(small.is_subset(&big));
        assert!(!big.is_subset(&small));
        assert!(BitSet::new(64).is_subset(&small));
    }

    #[test]
    fn test_bitset_iter_across_words() {
        let bs = BitSet::from_indices(200, [5, 64, 199]);
        assert_eq!(bs.iter().collect::<Vec<_>>(), vec![5, 64, 199]);
        assert_eq!(BitSet::new(0).iter().count(), 0);
        assert_eq!(format!("{bs:?}"), "{5, 64, 199}");
    }
}
