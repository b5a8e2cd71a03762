// SPDX-License-Identifier: MPL-2.0

use xxhash_rust::xxh3::xxh3_128;

use crate::prelude::*;

/// The 128-bit chunk name of a data block's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Name the content of one block.
    pub fn of_block(data: &[u8]) -> Self {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        Self(xxh3_128(data).to_le_bytes())
    }

    /// The raw name bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The hash zone responsible for this name.
    pub fn zone(&self, nzones: usize) -> usize {
        debug_assert!(nzones > 0);
        u64::from_le_bytes(self.0[0..8].try_into().unwrap()) as usize % nzones
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}
