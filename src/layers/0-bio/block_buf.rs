// SPDX-License-Identifier: MPL-2.0

//! This module provides API to represent buffers whose
//! sizes are block aligned. The advantage of using the
//! APIs provided this module over Rust std's counterparts
//! is to ensure the invariance of block-aligned length
//! at type level, eliminating the need for runtime check.
//!
//! There are three main types:
//! * `Buf`: A owned buffer whose length is a multiple of the block size.
//! * `BufRef`: An immutably-borrowed buffer whose length
//!   is a multiple of the block size.
//! * `BufMut`: A mutably-borrowed buffer whose length is
//!   a multiple of the block size.

use core::convert::TryFrom;

use super::BLOCK_SIZE;
use crate::prelude::*;

/// A owned buffer whose length is a multiple of the block size.
pub struct Buf(Vec<u8>);

impl Buf {
    /// Allocate specific number of blocks as memory buffer.
    pub fn alloc(num_blocks: usize) -> Result<Self> {
        if num_blocks == 0 {
            return_errno_with_msg!(
                InvalidArgs,
                "num_blocks must be greater than 0 for allocation"
            )
        }
        let buffer = vec![0; num_blocks * BLOCK_SIZE];
        Ok(Self(buffer))
    }

    /// Returns the number of blocks of owned buffer.
    pub fn nblocks(&self) -> usize {
        self.0.len() / BLOCK_SIZE
    }

    /// Returns the immutable slice of owned buffer.
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Returns the mutable slice of owned buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.0.as_mut_slice()
    }

    /// Converts to immutably-borrowed buffer `BufRef`.
    pub fn as_ref(&self) -> BufRef<'_> {
        BufRef(self.as_slice())
    }

    /// Coverts to mutably-borrowed buffer `BufMut`.
    pub fn as_mut(&mut self) -> BufMut<'_> {
        BufMut(self.as_mut_slice())
    }
}

/// An immutably-borrowed buffer whose length is a multiple of the block size.
#[derive(Clone, Copy)]
pub struct BufRef<'a>(&'a [u8]);

impl BufRef<'_> {
    /// Returns the immutable slice of borrowed buffer.
    pub fn as_slice(&self) -> &[u8] {
        self.0
    }

    /// Returns the number of blocks of borrowed buffer.
    pub fn nblocks(&self) -> usize {
        self.0.len() / BLOCK_SIZE
    }

    /// Returns an iterator for immutable buffers of `BLOCK_SIZE`.
    pub fn iter(&self) -> impl Iterator<Item = BufRef<'_>> {
        self.0.chunks_exact(BLOCK_SIZE).map(BufRef)
    }
}

impl<'a> TryFrom<&'a [u8]> for BufRef<'a> {
    type Error = crate::error::Error;

    fn try_from(buf: &'a [u8]) -> Result<Self> {
        if buf.is_empty() {
            return_errno_with_msg!(InvalidArgs, "empty buf in `BufRef::try_from`");
        }
        if buf.len() % BLOCK_SIZE != 0 {
            return_errno_with_msg!(
                NotBlockSizeAligned,
                "buf not block size aligned `BufRef::try_from`"
            );
        }

        let new_self = Self(buf);
        Ok(new_self)
    }
}

/// A mutably-borrowed buffer whose length is a multiple of the block size.
pub struct BufMut<'a>(&'a mut [u8]);

impl BufMut<'_> {
    /// Returns the immutable slice of borrowed buffer.
    pub fn as_slice(&self) -> &[u8] {
        self.0
    }

    /// Returns the mutable slice of borrowed buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.0
    }

    /// Returns the number of blocks of borrowed buffer.
    pub fn nblocks(&self) -> usize {
        self.0.len() / BLOCK_SIZE
    }
}

impl<'a> TryFrom<&'a mut [u8]> for BufMut<'a> {
    type Error = crate::error::Error;

    fn try_from(buf: &'a mut [u8]) -> Result<Self> {
        if buf.is_empty() {
            return_errno_with_msg!(InvalidArgs, "empty buf in `BufMut::try_from`");
        }
        if buf.len() % BLOCK_SIZE != 0 {
            return_errno_with_msg!(
                NotBlockSizeAligned,
                "buf not block size aligned `BufMut::try_from`"
            );
        }

        let new_self = Self(buf);
        Ok(new_self)
    }
}

#[cfg(test)]
mod tests {
    use super::{Buf, BufMut, BufRef, BLOCK_SIZE};

    #[test]
    fn buf() {
        let mut buf = Buf::alloc(10).unwrap();
        assert_eq!(buf.nblocks(), 10);
        assert_eq!(buf.as_slice().len(), 10 * BLOCK_SIZE);
        assert_eq!(buf.as_ref().iter().count(), 10);

        let mut bytes = [0u8; BLOCK_SIZE];
        assert_eq!(BufRef::try_from(bytes.as_slice()).unwrap().nblocks(), 1);
        assert_eq!(
            BufMut::try_from(bytes.as_mut_slice()).unwrap().nblocks(),
            1
        );
        assert!(buf.as_mut().as_mut_slice().len() == 10 * BLOCK_SIZE);
    }

    #[test]
    fn unaligned_rejected() {
        let bytes = [0u8; 100];
        assert!(BufRef::try_from(bytes.as_slice()).is_err());
    }
}
