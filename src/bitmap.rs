//! Fixed-width index sets used throughout the selection core
//!
//! Every candidate set, selection, topology domain, and core mask in this
//! crate is a [`Bitmap`] over a dense index space (node index or core
//! index). The API is the narrow set-algebra contract the strategies rely
//! on: first/last set bit, popcount, subset/overlap tests, in-place
//! and/or/and-not, and ascending-order iteration.

use bitvec::prelude::{BitVec, Lsb0};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fixed-width set of indices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap {
    bits: BitVec<usize, Lsb0>,
}

/// A set of node indices
pub type NodeMask = Bitmap;

/// A set of core indices on one node
pub type CoreMask = Bitmap;

impl Bitmap {
    /// Create an empty bitmap of the given width
    pub fn new(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, len),
        }
    }

    /// Create a bitmap of the given width with every bit set
    pub fn full(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(true, len),
        }
    }

    /// Create a bitmap from a list of set indices
    pub fn from_indices(len: usize, indices: &[usize]) -> Self {
        let mut map = Self::new(len);
        for &i in indices {
            map.set(i);
        }
        map
    }

    /// Width of the bitmap (number of addressable indices)
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True when the bitmap has zero width
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Set one bit
    pub fn set(&mut self, index: usize) {
        self.bits.set(index, true);
    }

    /// Clear one bit
    pub fn clear(&mut self, index: usize) {
        self.bits.set(index, false);
    }

    /// Test one bit
    pub fn test(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Lowest set index, if any
    pub fn first_set(&self) -> Option<usize> {
        self.iter_set().next()
    }

    /// Highest set index, if any
    pub fn last_set(&self) -> Option<usize> {
        self.iter_set().next_back()
    }

    /// Iterate set indices in ascending order
    pub fn iter_set(&self) -> impl DoubleEndedIterator<Item = usize> + '_ {
        (0..self.bits.len()).filter(move |&i| self.bits[i])
    }

    /// Clear every bit
    pub fn clear_all(&mut self) {
        for i in 0..self.bits.len() {
            self.bits.set(i, false);
        }
    }

    /// True when `other` is a subset of `self`
    pub fn is_superset_of(&self, other: &Bitmap) -> bool {
        debug_assert_eq!(self.len(), other.len());
        other.iter_set().all(|i| self.test(i))
    }

    /// True when the two bitmaps share at least one set bit
    pub fn overlaps(&self, other: &Bitmap) -> bool {
        debug_assert_eq!(self.len(), other.len());
        self.iter_set().any(|i| other.test(i))
    }

    /// Number of indices set in both bitmaps
    pub fn overlap_count(&self, other: &Bitmap) -> usize {
        debug_assert_eq!(self.len(), other.len());
        self.iter_set().filter(|&i| other.test(i)).count()
    }

    /// In-place intersection
    pub fn and_assign(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.len(), other.len());
        for i in 0..self.bits.len() {
            let v = self.bits[i] && other.test(i);
            self.bits.set(i, v);
        }
    }

    /// In-place union
    pub fn or_assign(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.len(), other.len());
        for i in 0..self.bits.len() {
            let v = self.bits[i] || other.test(i);
            self.bits.set(i, v);
        }
    }

    /// In-place difference (clear every bit set in `other`)
    pub fn and_not_assign(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.len(), other.len());
        for i in 0..self.bits.len() {
            let v = self.bits[i] && !other.test(i);
            self.bits.set(i, v);
        }
    }

    /// Intersection into a new bitmap
    pub fn and(&self, other: &Bitmap) -> Bitmap {
        let mut out = self.clone();
        out.and_assign(other);
        out
    }

    /// Difference into a new bitmap
    pub fn and_not(&self, other: &Bitmap) -> Bitmap {
        let mut out = self.clone();
        out.and_not_assign(other);
        out
    }

    /// Overwrite this bitmap with the contents of `other`
    pub fn copy_from(&mut self, other: &Bitmap) {
        debug_assert_eq!(self.len(), other.len());
        self.bits.clone_from(&other.bits);
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (n, i) in self.iter_set().enumerate() {
            if n > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", i)?;
        }
        write!(f, "}}")
    }
}
