// SPDX-License-Identifier: MPL-2.0

//! Persistence across close and reopen.

use std::sync::Arc;

use dedup_disk::{
    Buf, BufRef, DedupDisk, DiskConfig, MappingState, MemDisk, MemIndex, BLOCK_SIZE,
};

fn noise_block(seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let mut data = vec![0u8; BLOCK_SIZE];
    for chunk in data.chunks_exact_mut(8) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        chunk.copy_from_slice(&state.to_le_bytes());
    }
    data
}

fn read_block(disk: &DedupDisk<MemDisk>, lbn: u64) -> Vec<u8> {
    let mut buf = Buf::alloc(1).unwrap();
    disk.read(lbn, buf.as_mut()).unwrap();
    buf.as_slice().to_vec()
}

#[test]
fn reopen_preserves_data_and_reference_counts() {
    let device = MemDisk::create(4096).unwrap();
    let unique = noise_block(1);
    let shared = noise_block(2);
    let compressible = vec![0x11u8; BLOCK_SIZE];

    {
        let disk = DedupDisk::create(
            device.clone(),
            DiskConfig::default(),
            Arc::new(MemIndex::new()),
        )
        .unwrap();
        disk.write(0, BufRef::try_from(&unique[..]).unwrap()).unwrap();
        disk.write(1, BufRef::try_from(&shared[..]).unwrap()).unwrap();
        disk.write(2, BufRef::try_from(&shared[..]).unwrap()).unwrap();
        disk.write(3, BufRef::try_from(&compressible[..]).unwrap())
            .unwrap();
        disk.write(4, BufRef::try_from(&vec![0u8; BLOCK_SIZE][..]).unwrap())
            .unwrap();
        disk.sync().unwrap();
    }

    let disk = DedupDisk::open(
        device,
        DiskConfig::default(),
        Arc::new(MemIndex::new()),
    )
    .unwrap();

    assert_eq!(read_block(&disk, 0), unique);
    assert_eq!(read_block(&disk, 1), shared);
    assert_eq!(read_block(&disk, 2), shared);
    assert_eq!(read_block(&disk, 3), compressible);
    assert_eq!(read_block(&disk, 4), vec![0u8; BLOCK_SIZE]);

    let shared_mapping = disk.mapping_of(1).unwrap();
    assert_eq!(disk.mapping_of(2).unwrap().pbn, shared_mapping.pbn);
    assert_eq!(disk.reference_count(shared_mapping.pbn).unwrap(), 2);

    let packed = disk.mapping_of(3).unwrap();
    assert!(matches!(packed.state, MappingState::Compressed(_)));
    assert_eq!(disk.reference_count(packed.pbn).unwrap(), 1);
}

#[test]
fn reopened_disk_keeps_serving_writes() {
    let device = MemDisk::create(4096).unwrap();
    let first = noise_block(3);
    {
        let disk = DedupDisk::create(
            device.clone(),
            DiskConfig::default(),
            Arc::new(MemIndex::new()),
        )
        .unwrap();
        disk.write(0, BufRef::try_from(&first[..]).unwrap()).unwrap();
        // A plain drop must close cleanly too.
    }

    let disk = DedupDisk::open(
        device,
        DiskConfig::default(),
        Arc::new(MemIndex::new()),
    )
    .unwrap();
    assert_eq!(read_block(&disk, 0), first);

    // Dedup across the reopen boundary: the index restarted empty, so
    // the same content takes a second block, but overwrites still
    // release the old one.
    let second = noise_block(4);
    disk.write(0, BufRef::try_from(&second[..]).unwrap()).unwrap();
    assert_eq!(read_block(&disk, 0), second);
    let mapping = disk.mapping_of(0).unwrap();
    assert_eq!(disk.reference_count(mapping.pbn).unwrap(), 1);
}

#[test]
fn dirty_slabs_rebuild_from_the_block_map() {
    use dedup_disk::BlockSet;

    // Writes after the last sync leave their slabs marked dirty. Open a
    // crash image taken in that window: the depot must rebuild those
    // counts from the block map instead of trusting stale bytes.
    let device = MemDisk::create(4096).unwrap();
    let snapshot = MemDisk::create(4096).unwrap();
    let shared = noise_block(9);
    {
        let disk = DedupDisk::create(
            device.clone(),
            DiskConfig::default(),
            Arc::new(MemIndex::new()),
        )
        .unwrap();
        disk.sync().unwrap();
        for lbn in 0..8u64 {
            disk.write(lbn, BufRef::try_from(&shared[..]).unwrap()).unwrap();
        }

        // The crash image: device contents with acknowledged writes but
        // no final sync.
        let mut buf = Buf::alloc(1).unwrap();
        for pos in 0..device.nblocks() {
            device.read(pos, buf.as_mut()).unwrap();
            snapshot.write(pos, buf.as_ref()).unwrap();
        }
    }

    let disk = DedupDisk::open(
        snapshot,
        DiskConfig::default(),
        Arc::new(MemIndex::new()),
    )
    .unwrap();
    let mapping = disk.mapping_of(0).unwrap();
    assert_eq!(disk.reference_count(mapping.pbn).unwrap(), 8);
    for lbn in 0..8u64 {
        assert_eq!(disk.mapping_of(lbn).unwrap().pbn, mapping.pbn);
        assert_eq!(read_block(&disk, lbn), shared);
    }
}
