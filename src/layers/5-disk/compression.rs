// SPDX-License-Identifier: MPL-2.0

//! Block compression and the packed-block fragment codec.
//!
//! A packed physical block hosts up to fourteen compressed fragments. Its
//! header holds one `(offset, length)` pair per slot, little-endian
//! `u16`s; offsets are absolute within the block and a zero length marks
//! an empty slot. The fragment bytes follow the header back to back, and
//! the remainder of the block is padding.

use std::io::{Read, Write};

use crate::{
    layers::map::MAX_COMPRESSION_SLOTS,
    prelude::*,
};

/// Bytes reserved for the fragment header.
pub const PACKED_HEADER_SIZE: usize = MAX_COMPRESSION_SLOTS * 4;

/// The compressed size recorded for an incompressible block.
pub const INCOMPRESSIBLE: usize = BLOCK_SIZE + 1;

/// Largest fragment the packer accepts. Anything bigger could not share
/// a packed block with a second fragment, so packing it would waste the
/// container.
pub const MAX_FRAGMENT_SIZE: usize = (BLOCK_SIZE - PACKED_HEADER_SIZE) / 2;

/// Deflate one block. Returns the compressed bytes, or the
/// `INCOMPRESSIBLE` sentinel size when the block does not shrink enough
/// to be worth packing. Compression is best-effort: any codec failure is
/// reported as incompressible, never as an error.
pub fn compress(data: &[u8]) -> (usize, Vec<u8>) {
    debug_assert_eq!(data.len(), BLOCK_SIZE);
    let mut encoder = libflate::deflate::Encoder::new(Vec::with_capacity(MAX_FRAGMENT_SIZE));
    if encoder.write_all(data).is_err() {
        return (INCOMPRESSIBLE, Vec::new());
    }
    match encoder.finish().into_result() {
        Ok(compressed) if compressed.len() <= MAX_FRAGMENT_SIZE => {
            (compressed.len(), compressed)
        }
        _ => (INCOMPRESSIBLE, Vec::new()),
    }
}

/// Inflate one fragment back into a full block.
pub fn decompress(fragment: &[u8], out: &mut [u8]) -> Result<()> {
    debug_assert_eq!(out.len(), BLOCK_SIZE);
    let mut decoder = libflate::deflate::Decoder::new(fragment);
    let mut restored = Vec::with_capacity(BLOCK_SIZE);
    decoder
        .read_to_end(&mut restored)
        .map_err(|_| Error::with_msg(InvalidFragment, "fragment failed to inflate"))?;
    if restored.len() != BLOCK_SIZE {
        return_errno_with_msg!(InvalidFragment, "fragment inflated to the wrong size");
    }
    out.copy_from_slice(&restored);
    Ok(())
}

/// Assemble a packed block from fragments, slot by arrival order.
///
/// The fragments must fit; the packer guarantees that by construction.
pub fn pack_fragments(fragments: &[&[u8]], out: &mut [u8]) -> Result<()> {
    debug_assert_eq!(out.len(), BLOCK_SIZE);
    if fragments.len() > MAX_COMPRESSION_SLOTS {
        return_errno_with_msg!(InvalidArgs, "too many fragments for one packed block");
    }
    out.fill(0);
    let mut offset = PACKED_HEADER_SIZE;
    for (slot, fragment) in fragments.iter().enumerate() {
        if offset + fragment.len() > BLOCK_SIZE {
            return_errno_with_msg!(InvalidArgs, "fragments overflow the packed block");
        }
        let header = slot * 4;
        out[header..header + 2].copy_from_slice(&(offset as u16).to_le_bytes());
        out[header + 2..header + 4].copy_from_slice(&(fragment.len() as u16).to_le_bytes());
        out[offset..offset + fragment.len()].copy_from_slice(fragment);
        offset += fragment.len();
    }
    Ok(())
}

/// Locate one fragment inside a packed block.
pub fn fragment_of(block: &[u8], slot: u8) -> Result<&[u8]> {
    debug_assert_eq!(block.len(), BLOCK_SIZE);
    if slot as usize >= MAX_COMPRESSION_SLOTS {
        return_errno_with_msg!(InvalidFragment, "fragment slot is out of range");
    }
    let header = slot as usize * 4;
    let offset = u16::from_le_bytes([block[header], block[header + 1]]) as usize;
    let length = u16::from_le_bytes([block[header + 2], block[header + 3]]) as usize;
    if length == 0 {
        return_errno_with_msg!(InvalidFragment, "fragment slot is empty");
    }
    if offset < PACKED_HEADER_SIZE || offset + length > BLOCK_SIZE {
        return_errno_with_msg!(InvalidFragment, "fragment extent is malformed");
    }
    Ok(&block[offset..offset + length])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_round_trip() {
        let mut data = vec![0u8; BLOCK_SIZE];
        for (nth, byte) in data.iter_mut().enumerate() {
            *byte = (nth / 64) as u8;
        }
        let (size, compressed) = compress(&data);
        assert!(size <= MAX_FRAGMENT_SIZE);
        assert_eq!(compressed.len(), size);

        let mut restored = vec![0u8; BLOCK_SIZE];
        decompress(&compressed, &mut restored).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn random_bytes_are_incompressible() {
        // A keyed xorshift fills the block with noise deflate cannot shrink.
        let mut state = 0x9e37_79b9_7f4a_7c15u64;
        let mut data = vec![0u8; BLOCK_SIZE];
        for chunk in data.chunks_exact_mut(8) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            chunk.copy_from_slice(&state.to_le_bytes());
        }
        let (size, _) = compress(&data);
        assert_eq!(size, INCOMPRESSIBLE);
    }

    #[test]
    fn packed_block_round_trip() {
        let one = vec![1u8; 100];
        let two = vec![2u8; 900];
        let three = vec![3u8; 1500];
        let mut block = vec![0u8; BLOCK_SIZE];
        pack_fragments(&[&one, &two, &three], &mut block).unwrap();

        assert_eq!(fragment_of(&block, 0).unwrap(), &one[..]);
        assert_eq!(fragment_of(&block, 1).unwrap(), &two[..]);
        assert_eq!(fragment_of(&block, 2).unwrap(), &three[..]);
        assert!(fragment_of(&block, 3).is_err());
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let one = vec![1u8; 100];
        let mut block = vec![0u8; BLOCK_SIZE];
        pack_fragments(&[&one], &mut block).unwrap();
        // Claim a length that runs off the end of the block.
        block[2..4].copy_from_slice(&u16::MAX.to_le_bytes());
        let err = fragment_of(&block, 0).unwrap_err();
        assert_eq!(err.errno(), InvalidFragment);
    }
}
