//! Live ranges of logical predicates within one scope.
//!
//! A live range is a pair of bit vectors over positions `0..=n`, where `n`
//! is the number of member blocks in the scope. Position `i < n` is the
//! i-th block of the topological order; the extra position `n` is the
//! virtual loop-repeat position, used only by the header predicate to keep
//! it live across the back-edge.

use std::fmt;

use bit_set::BitSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRange {
    uses: BitSet,
    defs: BitSet,
    len: usize,
}

impl LiveRange {
    /// A live range over a scope with `num_blocks` member blocks.
    pub fn new(num_blocks: usize) -> Self {
        let len = num_blocks + 1;
        Self {
            uses: BitSet::with_capacity(len),
            defs: BitSet::with_capacity(len),
            len,
        }
    }

    pub fn add_use(&mut self, pos: usize) {
        debug_assert!(pos < self.len);
        self.uses.insert(pos);
    }

    pub fn add_def(&mut self, pos: usize) {
        debug_assert!(pos < self.len);
        self.defs.insert(pos);
    }

    pub fn is_use(&self, pos: usize) -> bool {
        self.uses.contains(pos)
    }

    pub fn is_def(&self, pos: usize) -> bool {
        self.defs.contains(pos)
    }

    /// Returns `true` if there is no use after `pos`.
    pub fn is_last_use(&self, pos: usize) -> bool {
        !self.uses.iter().any(|u| u > pos)
    }

    /// Returns `true` if the predicate is defined anywhere before `pos`.
    pub fn has_def_before(&self, pos: usize) -> bool {
        self.defs.iter().any(|d| d < pos)
    }

    /// Returns `true` if there is any use at or before `pos`.
    pub fn has_use_through(&self, pos: usize) -> bool {
        self.uses.iter().any(|u| u <= pos)
    }

    /// Looking forward from `pos`, returns `true` if this range has a use
    /// strictly before the next use of `other`.
    pub fn next_use_before(&self, pos: usize, other: &LiveRange) -> bool {
        debug_assert_eq!(self.len, other.len);
        for i in pos..self.len {
            if other.uses.contains(i) {
                return false;
            }
            if self.uses.contains(i) {
                return true;
            }
        }
        false
    }
}

impl fmt::Display for LiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const KIND: [char; 4] = ['-', 'u', 'd', 'x'];
        for i in 0..self.len {
            let mut x = 0;
            if self.uses.contains(i) {
                x += 1;
            }
            if self.defs.contains(i) {
                x += 2;
            }
            write!(f, "{}", KIND[x])?;
        }
        Ok(())
    }
}
