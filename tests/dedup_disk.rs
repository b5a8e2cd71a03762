// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios against an in-memory backing device.

use std::sync::Arc;

use dedup_disk::{
    BioFlags, BioReqBuilder, BioType, Buf, BufRef, DedupDisk, DiskConfig, Errno, MappingState,
    MemDisk, MemIndex, BLOCK_SIZE,
};

fn new_disk() -> DedupDisk<MemDisk> {
    let device = MemDisk::create(4096).unwrap();
    DedupDisk::create(device, DiskConfig::default(), Arc::new(MemIndex::new())).unwrap()
}

/// A keyed xorshift block that deflate cannot shrink.
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

fn write_block(disk: &DedupDisk<MemDisk>, lbn: u64, data: &[u8]) {
    disk.write(lbn, BufRef::try_from(data).unwrap()).unwrap();
}

fn read_block(disk: &DedupDisk<MemDisk>, lbn: u64) -> Vec<u8> {
    let mut buf = Buf::alloc(1).unwrap();
    disk.read(lbn, buf.as_mut()).unwrap();
    buf.as_slice().to_vec()
}

#[test]
fn write_then_read_one_block() {
    let disk = new_disk();
    let data = noise_block(1);

    write_block(&disk, 0, &data);
    assert_eq!(read_block(&disk, 0), data);

    let mapping = disk.mapping_of(0).unwrap();
    assert_eq!(mapping.state, MappingState::Uncompressed);
    assert_eq!(disk.reference_count(mapping.pbn).unwrap(), 1);
}

#[test]
fn identical_writes_share_one_physical_block() {
    let disk = new_disk();
    let data = noise_block(2);

    write_block(&disk, 0, &data);
    write_block(&disk, 1, &data);
    assert_eq!(read_block(&disk, 0), data);
    assert_eq!(read_block(&disk, 1), data);

    let first = disk.mapping_of(0).unwrap();
    let second = disk.mapping_of(1).unwrap();
    assert_eq!(first.pbn, second.pbn);
    assert_eq!(disk.reference_count(first.pbn).unwrap(), 2);
    assert_eq!(disk.statistics().dedup_hits, 1);
}

#[test]
fn zero_blocks_allocate_nothing() {
    let disk = new_disk();
    let free_before = disk.statistics().free_blocks;

    write_block(&disk, 0, &vec![0u8; BLOCK_SIZE]);
    assert_eq!(read_block(&disk, 0), vec![0u8; BLOCK_SIZE]);

    let mapping = disk.mapping_of(0).unwrap();
    assert!(!mapping.is_allocated());
    assert_eq!(disk.statistics().free_blocks, free_before);
    assert_eq!(disk.statistics().zero_blocks, 1);
}

#[test]
fn overwrite_releases_the_old_block() {
    let disk = new_disk();
    let first = noise_block(3);
    let second = noise_block(4);

    write_block(&disk, 0, &first);
    let old = disk.mapping_of(0).unwrap();
    assert_eq!(disk.reference_count(old.pbn).unwrap(), 1);

    write_block(&disk, 0, &second);
    assert_eq!(read_block(&disk, 0), second);
    assert_eq!(disk.reference_count(old.pbn).unwrap(), 0);

    let new = disk.mapping_of(0).unwrap();
    assert_ne!(new.pbn, old.pbn);
    assert_eq!(disk.reference_count(new.pbn).unwrap(), 1);
}

#[test]
fn compressible_neighbors_share_a_packed_block() {
    let device = MemDisk::create(4096).unwrap();
    let config = DiskConfig {
        // Keep the flush tick from racing the three arrivals apart.
        packer_timeout: core::time::Duration::from_millis(150),
        ..DiskConfig::default()
    };
    let disk = DedupDisk::create(device, config, Arc::new(MemIndex::new())).unwrap();

    // Three distinct, highly-compressible blocks in one request.
    let mut payload = vec![0u8; 3 * BLOCK_SIZE];
    for (nth, block) in payload.chunks_exact_mut(BLOCK_SIZE).enumerate() {
        block.fill(nth as u8 + 1);
    }
    let req = BioReqBuilder::new(BioType::Write)
        .sector(0)
        .data(payload.clone())
        .build();
    disk.submit_bio_sync(req).unwrap();

    let mut slots = Vec::new();
    let mut pbns = Vec::new();
    for lbn in 0..3u64 {
        let mapping = disk.mapping_of(lbn).unwrap();
        match mapping.state {
            MappingState::Compressed(slot) => slots.push(slot),
            state => panic!("lbn {lbn} not compressed: {state:?}"),
        }
        pbns.push(mapping.pbn);
    }
    assert_eq!(pbns[0], pbns[1]);
    assert_eq!(pbns[1], pbns[2]);
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), 3, "slots must be distinct");
    assert_eq!(disk.reference_count(pbns[0]).unwrap(), 3);

    for lbn in 0..3u64 {
        let expected = vec![lbn as u8 + 1; BLOCK_SIZE];
        assert_eq!(read_block(&disk, lbn), expected);
    }
    assert_eq!(disk.statistics().compressed_fragments, 3);
}

#[test]
fn discard_returns_zeroes_and_frees_space() {
    let disk = new_disk();
    let mut old_pbns = Vec::new();
    for lbn in 0..5u64 {
        write_block(&disk, lbn, &noise_block(10 + lbn));
        old_pbns.push(disk.mapping_of(lbn).unwrap().pbn);
    }

    disk.discard(0, 5).unwrap();
    for lbn in 0..5u64 {
        assert_eq!(read_block(&disk, lbn), vec![0u8; BLOCK_SIZE]);
        assert!(!disk.mapping_of(lbn).unwrap().is_mapped());
    }
    for pbn in old_pbns {
        assert_eq!(disk.reference_count(pbn).unwrap(), 0);
    }
}

#[test]
fn partial_discard_zeroes_only_its_sectors() {
    let disk = new_disk();
    for lbn in 0..3u64 {
        write_block(&disk, lbn, &noise_block(20 + lbn));
    }
    let kept0 = read_block(&disk, 0);
    let kept2 = read_block(&disk, 2);

    // Bytes [2048, 10240): half of block 0, all of block 1, half of
    // block 2.
    let req = BioReqBuilder::new(BioType::Discard)
        .sector(4)
        .nsectors(16)
        .build();
    disk.submit_bio_sync(req).unwrap();

    let block0 = read_block(&disk, 0);
    assert_eq!(&block0[..2048], &kept0[..2048]);
    assert_eq!(&block0[2048..], &vec![0u8; 2048][..]);

    assert_eq!(read_block(&disk, 1), vec![0u8; BLOCK_SIZE]);

    let block2 = read_block(&disk, 2);
    assert_eq!(&block2[..2048], &vec![0u8; 2048][..]);
    assert_eq!(&block2[2048..], &kept2[2048..]);
}

#[test]
fn partial_write_preserves_the_rest_of_the_block() {
    let disk = new_disk();
    let base = noise_block(30);
    write_block(&disk, 5, &base);

    // Overlay 1024 bytes at byte offset 512 within block 5.
    let overlay = vec![0xEEu8; 1024];
    let req = BioReqBuilder::new(BioType::Write)
        .sector(5 * 8 + 1)
        .data(overlay.clone())
        .build();
    disk.submit_bio_sync(req).unwrap();

    let merged = read_block(&disk, 5);
    assert_eq!(&merged[..512], &base[..512]);
    assert_eq!(&merged[512..1536], &overlay[..]);
    assert_eq!(&merged[1536..], &base[1536..]);
}

#[test]
fn unwritten_blocks_read_zero() {
    let disk = new_disk();
    assert_eq!(read_block(&disk, 100), vec![0u8; BLOCK_SIZE]);
}

#[test]
fn out_of_range_requests_are_rejected() {
    let disk = new_disk();
    let lbn = disk.total_blocks();
    let err = disk
        .write(lbn, BufRef::try_from(&noise_block(1)[..]).unwrap())
        .unwrap_err();
    assert_eq!(err.errno(), Errno::OutOfRange);
}

#[test]
fn fua_writes_complete_durably() {
    let disk = new_disk();
    let data = noise_block(40);
    let req = BioReqBuilder::new(BioType::Write)
        .sector(0)
        .data(data.clone())
        .flags(BioFlags::FUA.union(BioFlags::SYNC))
        .build();
    disk.submit_bio_sync(req).unwrap();
    assert_eq!(read_block(&disk, 0), data);
}

#[test]
fn flush_bio_is_supported() {
    let disk = new_disk();
    write_block(&disk, 0, &noise_block(41));
    let req = BioReqBuilder::new(BioType::Flush).build();
    disk.submit_bio_sync(req).unwrap();
}

#[test]
fn saturated_blocks_keep_accepting_writes() {
    let disk = new_disk();
    let data = noise_block(50);

    for lbn in 0..260u64 {
        write_block(&disk, lbn, &data);
    }

    let first = disk.mapping_of(0).unwrap();
    // Shares latched the count to its sticky maximum.
    assert_eq!(disk.reference_count(first.pbn).unwrap(), 255);

    // Later writers could not dedup against the saturated block, yet
    // every write succeeded with identical content.
    let mut pbns: Vec<u64> = (0..260u64)
        .map(|lbn| disk.mapping_of(lbn).unwrap().pbn)
        .collect();
    pbns.sort_unstable();
    pbns.dedup();
    assert!(pbns.len() >= 2);

    for lbn in [0u64, 128, 255, 259] {
        assert_eq!(read_block(&disk, lbn), data);
    }
}

#[test]
fn exhausted_depot_reports_out_of_space() {
    let device = MemDisk::create(128).unwrap();
    let config = DiskConfig {
        logical_blocks: 1024,
        slab_blocks: 64,
        journal_blocks: 16,
        journal_ring: 8,
        ..DiskConfig::default()
    };
    let disk = DedupDisk::create(device, config, Arc::new(MemIndex::new())).unwrap();

    let mut failed = None;
    for lbn in 0..256u64 {
        if let Err(e) = disk.write(lbn, BufRef::try_from(&noise_block(100 + lbn)[..]).unwrap()) {
            failed = Some((lbn, e));
            break;
        }
    }
    let (lbn, err) = failed.expect("the tiny depot must run out");
    assert_eq!(err.errno(), Errno::OutOfSpace);
    assert!(lbn > 0);

    // Deduplicated writes need no allocation and still succeed.
    let existing = read_block(&disk, 0);
    disk.write(512, BufRef::try_from(&existing[..]).unwrap())
        .unwrap();
    assert_eq!(read_block(&disk, 512), existing);
}

#[test]
fn concurrent_writers_stay_consistent() {
    let disk = Arc::new(new_disk());
    let mut handles = Vec::new();
    for worker in 0..4u64 {
        let disk = disk.clone();
        handles.push(std::thread::spawn(move || {
            for nth in 0..32u64 {
                let lbn = worker * 64 + nth;
                let data = noise_block(1000 + lbn);
                disk.write(lbn, BufRef::try_from(&data[..]).unwrap()).unwrap();
                let mut buf = Buf::alloc(1).unwrap();
                disk.read(lbn, buf.as_mut()).unwrap();
                assert_eq!(buf.as_slice(), &data[..]);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for worker in 0..4u64 {
        for nth in 0..32u64 {
            let lbn = worker * 64 + nth;
            assert_eq!(read_block(&disk, lbn), noise_block(1000 + lbn));
        }
    }
}

#[test]
fn same_lbn_write_races_serialize() {
    let disk = Arc::new(new_disk());
    let mut handles = Vec::new();
    for worker in 0..4u64 {
        let disk = disk.clone();
        handles.push(std::thread::spawn(move || {
            for round in 0..16u64 {
                let data = noise_block(worker * 100 + round + 1);
                disk.write(7, BufRef::try_from(&data[..]).unwrap()).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Whatever won, the mapping and its count are coherent.
    let mapping = disk.mapping_of(7).unwrap();
    assert!(mapping.is_allocated());
    assert_eq!(disk.reference_count(mapping.pbn).unwrap(), 1);
}

mod failing_device {
    use super::*;
    use core::ops::Range;
    use core::sync::atomic::{AtomicBool, Ordering};
    use dedup_disk::BlockSet;

    /// A MemDisk whose writes can be made to fail on demand.
    #[derive(Clone)]
    pub struct FailingDisk {
        inner: MemDisk,
        fail_writes: Arc<AtomicBool>,
    }

    impl FailingDisk {
        pub fn create(nblocks: usize) -> (Self, Arc<AtomicBool>) {
            let fail_writes = Arc::new(AtomicBool::new(false));
            (
                Self {
                    inner: MemDisk::create(nblocks).unwrap(),
                    fail_writes: fail_writes.clone(),
                },
                fail_writes,
            )
        }
    }

    impl BlockSet for FailingDisk {
        fn read(&self, pos: usize, buf: dedup_disk::BufMut) -> Result<(), dedup_disk::Error> {
            self.inner.read(pos, buf)
        }

        fn write(&self, pos: usize, buf: dedup_disk::BufRef) -> Result<(), dedup_disk::Error> {
            if self.fail_writes.load(Ordering::Acquire) {
                return Err(dedup_disk::Error::new(dedup_disk::Errno::IoFailed));
            }
            self.inner.write(pos, buf)
        }

        fn subset(&self, range: Range<usize>) -> Result<Self, dedup_disk::Error> {
            Ok(Self {
                inner: self.inner.subset(range)?,
                fail_writes: self.fail_writes.clone(),
            })
        }

        fn flush(&self) -> Result<(), dedup_disk::Error> {
            self.inner.flush()
        }

        fn nblocks(&self) -> usize {
            self.inner.nblocks()
        }
    }

    #[test]
    fn metadata_failure_latches_read_only() {
        let (device, fail_writes) = FailingDisk::create(4096);
        let disk =
            DedupDisk::create(device, DiskConfig::default(), Arc::new(MemIndex::new())).unwrap();
        let data = noise_block(7);
        disk.write(0, BufRef::try_from(&data[..]).unwrap()).unwrap();

        fail_writes.store(true, Ordering::Release);
        // A zero write goes straight at the metadata path; its failure
        // must latch the engine read-only.
        let err = disk
            .write(1, BufRef::try_from(&vec![0u8; BLOCK_SIZE][..]).unwrap())
            .unwrap_err();
        assert!(matches!(
            err.errno(),
            dedup_disk::Errno::IoFailed | dedup_disk::Errno::ReadOnly
        ));
        assert!(disk.statistics().read_only);

        // Writes now fail fast; reads still serve.
        let err = disk
            .write(2, BufRef::try_from(&data[..]).unwrap())
            .unwrap_err();
        assert_eq!(err.errno(), dedup_disk::Errno::ReadOnly);

        fail_writes.store(false, Ordering::Release);
        let mut buf = Buf::alloc(1).unwrap();
        disk.read(0, buf.as_mut()).unwrap();
        assert_eq!(buf.as_slice(), &data[..]);
    }
}

#[test]
fn statistics_track_the_pipeline() {
    let disk = new_disk();
    write_block(&disk, 0, &noise_block(60));
    write_block(&disk, 1, &read_block(&disk, 0));
    write_block(&disk, 2, &vec![0u8; BLOCK_SIZE]);
    disk.discard(3, 1).unwrap();

    let stats = disk.statistics();
    assert_eq!(stats.writes, 3);
    assert_eq!(stats.discards, 1);
    assert!(stats.reads >= 1);
    assert_eq!(stats.dedup_hits, 1);
    assert_eq!(stats.zero_blocks, 1);
    assert!(stats.journal_entries >= 4);
    assert!(!stats.read_only);
}

#[test]
fn suspend_refuses_new_requests_until_resume() {
    let disk = new_disk();
    write_block(&disk, 0, &noise_block(70));
    disk.suspend().unwrap();

    let err = disk
        .write(1, BufRef::try_from(&noise_block(71)[..]).unwrap())
        .unwrap_err();
    assert_eq!(err.errno(), Errno::Protocol);

    disk.resume();
    write_block(&disk, 1, &noise_block(71));
    assert_eq!(read_block(&disk, 1), noise_block(71));
}
