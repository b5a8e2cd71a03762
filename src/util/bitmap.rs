// SPDX-License-Identifier: MPL-2.0

use bittle::{Bits, BitsMut};
use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// A compact array of bits.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BitMap {
    bits: Vec<u64>,
    nbits: usize,
}

impl BitMap {
    /// The one bit represents `true`.
    const ONE: bool = true;

    /// Create a new `BitMap` by repeating the `value` for the desired length.
    pub fn repeat(value: bool, nbits: usize) -> Self {
        let vec_len = nbits.div_ceil(64);
        let mut bits = Vec::with_capacity(vec_len);
        if value == Self::ONE {
            bits.resize(vec_len, !0u64);
        } else {
            bits.resize(vec_len, 0u64);
        }

        // Clear the unused bits in the last u64.
        if nbits % 64 != 0 {
            let last = vec_len - 1;
            for index in (nbits % 64)..64 {
                bits[last].clear_bit(index as u32);
            }
        }

        Self { bits, nbits }
    }

    /// Return the total number of bits.
    pub fn len(&self) -> usize {
        self.nbits
    }

    /// Return whether the bitmap holds no bits.
    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    fn check_index(&self, index: usize) {
        if index >= self.len() {
            panic!(
                "bitmap index {} is out of range, total bits {}",
                index, self.nbits,
            );
        }
    }

    /// Test if the given bit is set.
    ///
    /// # Panics
    ///
    /// The `index` must be within the total number of bits. Otherwise, this method panics.
    pub fn test_bit(&self, index: usize) -> bool {
        self.check_index(index);
        self.bits.test_bit(index as _)
    }

    /// Set the given bit with one bit.
    ///
    /// # Panics
    ///
    /// The `index` must be within the total number of bits. Otherwise, this method panics.
    pub fn set_bit(&mut self, index: usize) {
        self.check_index(index);
        self.bits.set_bit(index as _);
    }

    /// Clear the given bit with zero bit.
    ///
    /// # Panics
    ///
    /// The `index` must be within the total number of bits. Otherwise, this method panics.
    pub fn clear_bit(&mut self, index: usize) {
        self.check_index(index);
        self.bits.clear_bit(index as _)
    }

    /// Set the given bit with `value`.
    ///
    /// One bit is set for `true`, and zero bit for `false`.
    ///
    /// # Panics
    ///
    /// The `index` must be within the total number of bits. Otherwise, this method panics.
    pub fn set(&mut self, index: usize, value: bool) {
        if value == Self::ONE {
            self.set_bit(index);
        } else {
            self.clear_bit(index);
        }
    }

    fn bits_not_in_use(&self) -> usize {
        self.bits.len() * 64 - self.nbits
    }

    /// Get the number of one bits in the bitmap.
    pub fn count_ones(&self) -> usize {
        self.bits.count_ones() as _
    }

    /// Get the number of zero bits in the bitmap.
    pub fn count_zeros(&self) -> usize {
        let total_zeros = self.bits.count_zeros() as usize;
        total_zeros - self.bits_not_in_use()
    }

    /// Find the index of the first one bit, starting from the given index (inclusively).
    ///
    /// Return `None` if no one bit is found.
    ///
    /// # Panics
    ///
    /// The `from` index must be within the total number of bits. Otherwise, this method panics.
    pub fn first_one(&self, from: usize) -> Option<usize> {
        self.check_index(from);
        let first_u64_index = from / 64;

        self.bits[first_u64_index..]
            .iter_ones()
            .map(|index| first_u64_index * 64 + (index as usize))
            .find(|&index| index >= from)
    }

    /// Find the index of the first zero bit, starting from the given index (inclusively).
    ///
    /// Return `None` if no zero bit is found.
    ///
    /// # Panics
    ///
    /// The `from` index must be within the total number of bits. Otherwise, this method panics.
    pub fn first_zero(&self, from: usize) -> Option<usize> {
        self.check_index(from);
        let first_u64_index = from / 64;

        self.bits[first_u64_index..]
            .iter_zeros()
            .map(|index| first_u64_index * 64 + (index as usize))
            .find(|&index| index >= from && index < self.len())
    }

    /// Iterate the indexes of all one bits.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        let nbits = self.nbits;
        self.bits
            .iter_ones()
            .map(|index| index as usize)
            .filter(move |&index| index < nbits)
    }
}

#[cfg(test)]
mod tests {
    use super::BitMap;

    #[test]
    fn repeat_and_count() {
        let bm = BitMap::repeat(true, 100);
        assert_eq!(bm.len(), 100);
        assert_eq!(bm.count_ones(), 100);
        assert_eq!(bm.count_zeros(), 0);

        let bm = BitMap::repeat(false, 100);
        assert_eq!(bm.count_ones(), 0);
        assert_eq!(bm.count_zeros(), 100);
    }

    #[test]
    fn set_and_find() {
        let mut bm = BitMap::repeat(false, 130);
        bm.set_bit(7);
        bm.set(129, true);
        assert!(bm.test_bit(7));
        assert_eq!(bm.first_one(0), Some(7));
        assert_eq!(bm.first_one(8), Some(129));
        assert_eq!(bm.iter_ones().collect::<Vec<_>>(), vec![7, 129]);

        bm.clear_bit(7);
        assert_eq!(bm.first_one(0), Some(129));
        assert_eq!(bm.first_zero(0), Some(0));
    }
}
