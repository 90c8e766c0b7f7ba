//! # Bounded Register Sets
//!
//! A small bitset over PMU register numbers, replacing raw mask words and
//! manual bit arithmetic. Register numbers are bounded by
//! [`RegSet::CAPACITY`]; the register model's implemented-register masks
//! provide the per-platform bound on top of that.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};

/// A set of PMU register numbers.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegSet(u64);

impl RegSet {
    /// Highest representable register number plus one.
    pub const CAPACITY: usize = 64;

    /// The empty set.
    pub const EMPTY: RegSet = RegSet(0);

    /// Build a set from a raw mask word.
    #[inline]
    pub const fn from_mask(mask: u64) -> Self {
        RegSet(mask)
    }

    /// The raw mask word.
    #[inline]
    pub const fn mask(self) -> u64 {
        self.0
    }

    /// Add register `reg` to the set.
    #[inline]
    pub fn set(&mut self, reg: usize) {
        debug_assert!(reg < Self::CAPACITY);
        self.0 |= 1 << reg;
    }

    /// Remove register `reg` from the set.
    #[inline]
    pub fn clear(&mut self, reg: usize) {
        self.0 &= !(1u64 << reg);
    }

    /// Is register `reg` in the set?
    #[inline]
    pub fn test(self, reg: usize) -> bool {
        reg < Self::CAPACITY && self.0 & (1 << reg) != 0
    }

    /// Is the set empty?
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of registers in the set.
    #[inline]
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest register in the set, if any.
    #[inline]
    pub fn first(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Registers in `self` but not in `other`.
    #[inline]
    pub fn difference(self, other: RegSet) -> RegSet {
        RegSet(self.0 & !other.0)
    }

    /// Is `self` a subset of `other`?
    #[inline]
    pub fn subset_of(self, other: RegSet) -> bool {
        self.0 & !other.0 == 0
    }

    /// Iterate the register numbers in ascending order.
    pub fn iter(self) -> RegSetIter {
        RegSetIter(self.0)
    }
}

impl BitOr for RegSet {
    type Output = RegSet;

    fn bitor(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for RegSet {
    fn bitor_assign(&mut self, rhs: RegSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for RegSet {
    type Output = RegSet;

    fn bitand(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 & rhs.0)
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegSet({:#x})", self.0)
    }
}

impl IntoIterator for RegSet {
    type Item = usize;
    type IntoIter = RegSetIter;

    fn into_iter(self) -> RegSetIter {
        self.iter()
    }
}

/// Iterator over the registers of a [`RegSet`].
#[derive(Debug, Clone)]
pub struct RegSetIter(u64);

impl Iterator for RegSetIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let reg = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(reg)
    }
}
