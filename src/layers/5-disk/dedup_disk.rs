// SPDX-License-Identifier: MPL-2.0

//! The deduplicating, compressing virtual block device.
//!
//! API: submit_bio(), submit_bio_sync(), create(), open(),
//! read(), write(), discard(), sync(), suspend(), resume().
//!
//! `DedupDisk` maps a logical block address space onto a smaller pool of
//! physical blocks. Every write is zero-checked, fingerprinted, checked
//! against the dedup index, optionally compressed and packed, and either
//! shares an existing physical block or takes a fresh allocation. Each
//! request is carried by a data-VIO that hops between the engine's zones
//! (see `zone.rs`); the phase dispatch below is the whole pipeline.

use core::{
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use super::{
    bio::{BioFlags, BioReq, BioReqBuilder, BioResp, BioShare, BioType},
    compression::{self, MAX_FRAGMENT_SIZE},
    data_vio::{DataVio, Phase, VioCompressionStage, VioOperation},
    packer::{ClosedBin, Packer},
    pool::VioPool,
    super_block::SuperBlock,
    zone::{Work, ZoneKind, ZoneSet},
};
use crate::{
    error::Errno,
    layers::{
        bio::{BlockSet, Buf, BufMut, BufRef, SECTORS_PER_BLOCK},
        dedup::{AcquireRole, DedupIndex, Fingerprint, HashLockState, HashZone, QueryOutcome, ReleaseOutcome},
        depot::{DepotConfig, PbnLockMap, PbnLockType, SlabDepot},
        journal::{self, JournalEntry, LockCounter, RecoveryJournal, ZoneType},
        map::{BlockMap, DataLocation, Lbn, Pbn},
    },
    os::{self, Condvar, CvarMutex, HashMap, Mutex},
    prelude::*,
};

/// Tunables and geometry requests for a new or reopened device.
#[derive(Clone, Debug)]
pub struct DiskConfig {
    /// Size of the logical address space, in blocks.
    pub logical_blocks: u64,
    /// Blocks per slab.
    pub slab_blocks: usize,
    /// Size of the recovery-journal region, in blocks.
    pub journal_blocks: usize,
    /// In-flight journal blocks (lock-counter slots).
    pub journal_ring: usize,
    pub logical_zones: usize,
    pub physical_zones: usize,
    pub hash_zones: usize,
    /// Cached block-map leaf pages per logical zone.
    pub map_cache_pages: usize,
    /// Maximum in-flight requests.
    pub request_limit: usize,
    /// Maximum concurrent discards.
    pub discard_limit: usize,
    /// Advice queries slower than this count as "no advice".
    pub advice_deadline: Duration,
    /// Bins that idle this long are flushed, bounding write latency.
    pub packer_timeout: Duration,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            logical_blocks: 8192,
            slab_blocks: 256,
            journal_blocks: 32,
            journal_ring: 16,
            logical_zones: 2,
            physical_zones: 2,
            hash_zones: 2,
            map_cache_pages: 64,
            request_limit: 64,
            discard_limit: 8,
            advice_deadline: Duration::from_millis(100),
            packer_timeout: Duration::from_millis(10),
        }
    }
}

/// A point-in-time snapshot of the engine's counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct Statistics {
    pub bios_in: u64,
    pub reads: u64,
    pub writes: u64,
    pub discards: u64,
    pub flushes: u64,
    pub zero_blocks: u64,
    pub dedup_hits: u64,
    pub compressed_fragments: u64,
    pub advice_timeouts: u64,
    pub advice_errors: u64,
    pub journal_entries: u64,
    pub free_blocks: u64,
    pub read_only: bool,
}

#[derive(Default)]
struct Stats {
    bios_in: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    discards: AtomicU64,
    flushes: AtomicU64,
    zero_blocks: AtomicU64,
    dedup_hits: AtomicU64,
    compressed_fragments: AtomicU64,
    advice_timeouts: AtomicU64,
    advice_errors: AtomicU64,
    journal_entries: AtomicU64,
}

/// The device.
pub struct DedupDisk<D: BlockSet + 'static> {
    inner: Arc<DiskInner<D>>,
    threads: Mutex<Vec<os::JoinHandle<()>>>,
    flusher_stop: Arc<AtomicBool>,
}

/// Everything the zone threads share.
pub(super) struct DiskInner<D> {
    device: D,
    config: DiskConfig,
    sb: Mutex<SuperBlock>,
    zones: ZoneSet,
    block_map: BlockMap<D>,
    journal: RecoveryJournal<D>,
    depot: SlabDepot<D>,
    index: Arc<dyn DedupIndex>,
    pool: VioPool,
    /// Per-LBN serialization; presence of a key is the lock, the queue
    /// holds the data-VIOs waiting for it.
    logical_locks: Vec<Mutex<HashMap<Lbn, VecDeque<Box<DataVio>>>>>,
    pbn_locks: Vec<Mutex<PbnLockMap<Box<DataVio>>>>,
    hash_zones: Vec<Mutex<HashZone<Box<DataVio>>>>,
    packer: Mutex<Packer>,
    /// Data-VIOs parked behind a full journal ring; journal-zone owned.
    journal_waiters: Mutex<VecDeque<Box<DataVio>>>,
    alloc_cursor: AtomicUsize,
    read_only: AtomicBool,
    suspended: AtomicBool,
    in_flight: CvarMutex<u64>,
    quiesced: Condvar,
    stats: Stats,
}

impl<D: BlockSet + 'static> DedupDisk<D> {
    /// Format `device` and bring up a fresh engine over it.
    pub fn create(device: D, config: DiskConfig, index: Arc<dyn DedupIndex>) -> Result<Self> {
        Self::check_config(&config)?;
        let map_blocks = BlockMap::<D>::required_blocks(config.logical_blocks) as u64;
        let depot_start = 1 + config.journal_blocks as u64 + 1 + map_blocks;
        let remaining = (device.nblocks() as u64).saturating_sub(depot_start);
        let slab_count = remaining / config.slab_blocks as u64;
        if slab_count == 0 {
            return_errno_with_msg!(OutOfRange, "device too small for even one slab");
        }

        let sb = SuperBlock::new(
            config.logical_blocks,
            config.journal_blocks as u64,
            map_blocks,
            slab_count,
            config.slab_blocks as u64,
        );
        sb.persist(&device)?;

        let map_region =
            device.subset(sb.map_start as BlockId..(sb.map_start + sb.map_blocks) as BlockId)?;
        BlockMap::format(&map_region, sb.logical_blocks)?;
        let block_map = BlockMap::open(
            map_region,
            sb.logical_blocks,
            config.logical_zones,
            config.map_cache_pages,
        )?;

        let depot = SlabDepot::format(
            device.subset(0..device.nblocks())?,
            device.subset(
                sb.summary_start as BlockId..(sb.summary_start + sb.summary_blocks) as BlockId,
            )?,
            sb.depot_start,
            DepotConfig {
                slab_count: sb.slab_count as usize,
                slab_blocks: sb.slab_blocks as usize,
                physical_zones: config.physical_zones,
            },
        )?;

        Self::assemble(device, sb, config, index, block_map, depot, 1)
    }

    /// Recover the engine persisted on `device`: replay the journal into
    /// the block map, then rebuild the reference counts of every slab
    /// the summary calls dirty.
    pub fn open(device: D, config: DiskConfig, index: Arc<dyn DedupIndex>) -> Result<Self> {
        Self::check_config(&config)?;
        let sb = SuperBlock::load(&device)?;

        let map_region =
            device.subset(sb.map_start as BlockId..(sb.map_start + sb.map_blocks) as BlockId)?;
        let block_map = BlockMap::open(
            map_region,
            sb.logical_blocks,
            config.logical_zones,
            config.map_cache_pages,
        )?;

        let journal_region = device.subset(
            sb.journal_start as BlockId..(sb.journal_start + sb.journal_blocks) as BlockId,
        )?;
        let max_seq = journal::replay(&journal_region, sb.journal_replay_from, |entry| {
            block_map.put_mapped(entry.lbn, entry.new)
        })?;

        let (depot, dirty) = SlabDepot::open(
            device.subset(0..device.nblocks())?,
            device.subset(
                sb.summary_start as BlockId..(sb.summary_start + sb.summary_blocks) as BlockId,
            )?,
            sb.depot_start,
            DepotConfig {
                slab_count: sb.slab_count as usize,
                slab_blocks: sb.slab_blocks as usize,
                physical_zones: config.physical_zones,
            },
        )?;
        if !dirty.is_empty() {
            info!("[DedupDisk] rebuilding reference counts of {} slabs", dirty.len());
            depot.begin_rebuild(&dirty);
            block_map.scan_mapped(|_, loc| depot.apply_rebuild_reference(loc))?;
            depot.finish_rebuild(&dirty);
        }

        Self::assemble(device, sb, config, index, block_map, depot, max_seq + 1)
    }

    fn check_config(config: &DiskConfig) -> Result<()> {
        if config.logical_zones == 0 || config.physical_zones == 0 || config.hash_zones == 0 {
            return_errno_with_msg!(InvalidArgs, "every zone type needs at least one zone");
        }
        if config.journal_blocks < config.journal_ring || config.journal_ring == 0 {
            return_errno_with_msg!(InvalidArgs, "journal region smaller than its ring");
        }
        if config.logical_blocks == 0 {
            return_errno_with_msg!(InvalidArgs, "logical space must be non-empty");
        }
        Ok(())
    }

    fn assemble(
        device: D,
        sb: SuperBlock,
        config: DiskConfig,
        index: Arc<dyn DedupIndex>,
        block_map: BlockMap<D>,
        depot: SlabDepot<D>,
        next_seq: u64,
    ) -> Result<Self> {
        let counter = Arc::new(LockCounter::new(
            config.journal_ring,
            config.logical_zones,
            config.physical_zones,
        ));
        let journal_region = device.subset(
            sb.journal_start as BlockId..(sb.journal_start + sb.journal_blocks) as BlockId,
        )?;
        let journal = RecoveryJournal::new(journal_region, counter.clone(), next_seq)?;

        let (zones, receivers) = ZoneSet::build(
            config.logical_zones,
            config.physical_zones,
            config.hash_zones,
        );
        let pool = VioPool::new(config.request_limit, config.discard_limit)?;

        let inner = Arc::new(DiskInner {
            logical_locks: (0..config.logical_zones)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            pbn_locks: (0..config.physical_zones)
                .map(|_| Mutex::new(PbnLockMap::new()))
                .collect(),
            hash_zones: (0..config.hash_zones)
                .map(|_| Mutex::new(HashZone::new()))
                .collect(),
            device,
            config,
            sb: Mutex::new(sb),
            zones,
            block_map,
            journal,
            depot,
            index,
            pool,
            packer: Mutex::new(Packer::new()),
            journal_waiters: Mutex::new(VecDeque::new()),
            alloc_cursor: AtomicUsize::new(0),
            read_only: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            in_flight: CvarMutex::new(0),
            quiesced: Condvar::new(),
            stats: Stats::default(),
        });

        // Journal-block release edges wake the journal zone to reap.
        let weak = Arc::downgrade(&inner);
        counter.set_notification(Box::new(move |_lock| {
            if let Some(inner) = weak.upgrade() {
                let worker = inner.clone();
                inner
                    .zones
                    .journal
                    .send_task(Box::new(move || worker.journal_reap()));
            }
        }));

        let mut threads = Vec::new();
        for (_kind, receiver) in receivers {
            let inner = inner.clone();
            threads.push(os::spawn(move || {
                while let Ok(work) = receiver.recv() {
                    match work {
                        Work::Vio(vio) => inner.run_phase(vio),
                        Work::Task(task) => task(),
                        Work::Shutdown => break,
                    }
                }
            }));
        }

        // The packer flush tick: no bin may stall a write forever.
        let flusher_stop = Arc::new(AtomicBool::new(false));
        let stop = flusher_stop.clone();
        let weak = Arc::downgrade(&inner);
        let timeout = inner.config.packer_timeout;
        threads.push(os::spawn(move || loop {
            std::thread::sleep(timeout);
            if stop.load(Ordering::Acquire) {
                break;
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let worker = inner.clone();
            inner
                .zones
                .packer
                .send_task(Box::new(move || worker.flush_packer_bins()));
        }));

        info!("[DedupDisk] engine up: {:?}", &inner.config);
        Ok(Self {
            inner,
            threads: Mutex::new(threads),
            flusher_stop,
        })
    }

    /// Submit a block I/O request and wait for its completion.
    pub fn submit_bio_sync(&self, bio_req: BioReq) -> BioResp {
        let req = Arc::new(bio_req);
        self.submit_bio(req.clone())?;
        req.wait()
    }

    /// Submit a block I/O request. Completion is delivered through the
    /// request's callback and `wait()`.
    pub fn submit_bio(&self, req: Arc<BioReq>) -> Result<()> {
        req.submit();
        self.inner.stats.bios_in.fetch_add(1, Ordering::Relaxed);

        if self.inner.suspended.load(Ordering::Acquire) {
            req.complete(Err(Error::with_msg(Protocol, "device is suspended")));
            return Ok(());
        }

        match req.type_() {
            BioType::Flush => {
                self.inner.stats.flushes.fetch_add(1, Ordering::Relaxed);
                let res = self.sync();
                req.complete(res);
                return Ok(());
            }
            BioType::Write | BioType::Discard
                if self.inner.read_only.load(Ordering::Acquire) =>
            {
                req.complete(Err(Error::new(ReadOnly)));
                return Ok(());
            }
            _ => {}
        }

        if req.flags().contains(BioFlags::PREFLUSH) {
            if let Err(e) = self.sync() {
                req.complete(Err(e));
                return Ok(());
            }
        }

        let range = req.byte_range();
        let logical_bytes = self.inner.config.logical_blocks * BLOCK_SIZE as u64;
        if range.end > logical_bytes || range.is_empty() {
            req.complete(Err(Error::with_msg(
                OutOfRange,
                "request is beyond the logical space",
            )));
            return Ok(());
        }

        match req.type_() {
            BioType::Read | BioType::Write => self.launch_rw(req),
            BioType::Discard => self.launch_discard(req),
            BioType::Flush => unreachable!(),
        }
        Ok(())
    }

    fn launch_rw(&self, req: Arc<BioReq>) {
        let inner = &self.inner;
        let range = req.byte_range();
        let start_block = range.start / BLOCK_SIZE as u64;
        let end_block = range.end.div_ceil(BLOCK_SIZE as u64);
        let share = Arc::new(BioShare::new(
            req.clone(),
            (end_block - start_block) as usize,
        ));

        match req.type_() {
            BioType::Read => inner.stats.reads.fetch_add(1, Ordering::Relaxed),
            _ => inner.stats.writes.fetch_add(1, Ordering::Relaxed),
        };

        for lbn in start_block..end_block {
            let block_start = lbn * BLOCK_SIZE as u64;
            let overlap_start = range.start.max(block_start);
            let overlap_end = range.end.min(block_start + BLOCK_SIZE as u64);
            let offset = (overlap_start - block_start) as usize;
            let length = (overlap_end - overlap_start) as usize;

            let mut vio = inner.pool.acquire(false);
            vio.lbn = lbn;
            vio.parent = Some(share.clone());
            vio.offset = offset;
            vio.length = length;
            vio.bio_offset = (overlap_start - range.start) as usize;
            vio.is_partial = length < BLOCK_SIZE;
            vio.flush_after = req.flags().contains(BioFlags::FUA);
            vio.logical_zone_id = inner.block_map.zone_of(lbn);

            match req.type_() {
                BioType::Read => vio.operation = VioOperation::Read,
                BioType::Write if vio.is_partial => {
                    vio.operation = VioOperation::ReadModifyWrite;
                }
                BioType::Write => {
                    vio.operation = VioOperation::Write;
                    let bio_offset = vio.bio_offset;
                    req.access_data_with(|data| {
                        vio.data
                            .as_mut_slice()
                            .copy_from_slice(&data[bio_offset..bio_offset + BLOCK_SIZE]);
                    });
                    vio.is_zero_block = vio.data.as_slice().iter().all(|byte| *byte == 0);
                    if vio.is_zero_block {
                        inner.stats.zero_blocks.fetch_add(1, Ordering::Relaxed);
                    }
                }
                _ => unreachable!(),
            }

            inner.note_launched();
            inner.enqueue(ZoneKind::Logical(vio.logical_zone_id), vio, Phase::Launch);
        }
    }

    fn launch_discard(&self, req: Arc<BioReq>) {
        let inner = &self.inner;
        let range = req.byte_range();
        let start_block = range.start / BLOCK_SIZE as u64;
        let end_block = range.end.div_ceil(BLOCK_SIZE as u64);
        inner.stats.discards.fetch_add(1, Ordering::Relaxed);

        let share = Arc::new(BioShare::new(req.clone(), 1));
        let mut vio = inner.pool.acquire(true);
        vio.operation = VioOperation::Discard;
        vio.is_trim = true;
        vio.lbn = start_block;
        vio.remaining_discard = end_block - start_block;
        vio.parent = Some(share);
        vio.flush_after = req.flags().contains(BioFlags::FUA);
        vio.logical_zone_id = inner.block_map.zone_of(start_block);

        inner.note_launched();
        inner.enqueue(ZoneKind::Logical(vio.logical_zone_id), vio, Phase::Launch);
    }

    /// Read whole blocks at `lbn` into `buf`.
    pub fn read(&self, lbn: Lbn, mut buf: BufMut) -> Result<()> {
        let req = Arc::new(
            BioReqBuilder::new(BioType::Read)
                .sector(lbn * SECTORS_PER_BLOCK as u64)
                .data(vec![0u8; buf.nblocks() * BLOCK_SIZE])
                .build(),
        );
        self.submit_bio(req.clone())?;
        req.wait()?;
        let data = req.take_data();
        buf.as_mut_slice().copy_from_slice(&data);
        Ok(())
    }

    /// Write whole blocks from `buf` at `lbn`.
    pub fn write(&self, lbn: Lbn, buf: BufRef) -> Result<()> {
        let req = BioReqBuilder::new(BioType::Write)
            .sector(lbn * SECTORS_PER_BLOCK as u64)
            .data(buf.as_slice().to_vec())
            .build();
        self.submit_bio_sync(req)
    }

    /// Discard `nblocks` whole blocks starting at `lbn`.
    pub fn discard(&self, lbn: Lbn, nblocks: usize) -> Result<()> {
        let req = BioReqBuilder::new(BioType::Discard)
            .sector(lbn * SECTORS_PER_BLOCK as u64)
            .nsectors((nblocks * SECTORS_PER_BLOCK) as u32)
            .build();
        self.submit_bio_sync(req)
    }

    /// Flush everything acknowledged so far down to stable storage.
    pub fn sync(&self) -> Result<()> {
        let inner = &self.inner;
        // Close packer bins until the pipeline drains; staged fragments
        // hold admitted requests in flight.
        loop {
            inner.flush_packer_bins();
            if inner.read_only.load(Ordering::Acquire) {
                // Appends parked behind the ring can never proceed now.
                let stalled: Vec<_> = inner.journal_waiters.lock().drain(..).collect();
                for vio in stalled {
                    inner.fail_vio(vio, ReadOnly);
                }
            }
            let in_flight = inner.in_flight.lock().unwrap();
            if *in_flight == 0 {
                break;
            }
            let (_guard, _timed_out) = inner
                .quiesced
                .wait_timeout(in_flight, Duration::from_millis(5))
                .unwrap();
        }

        inner.journal.flush()?;
        inner.depot.persist_all()?;
        {
            let mut sb = inner.sb.lock();
            sb.journal_replay_from = inner.journal.next_commit_seq();
            sb.persist(&inner.device)?;
        }
        inner.device.flush()
    }

    /// Drain the pipeline and persist all metadata; new submissions are
    /// refused until `resume`.
    pub fn suspend(&self) -> Result<()> {
        self.inner.suspended.store(true, Ordering::Release);
        self.sync()
    }

    /// Reopen admission after a `suspend`.
    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::Release);
    }

    /// A snapshot of the engine's counters.
    pub fn statistics(&self) -> Statistics {
        let stats = &self.inner.stats;
        Statistics {
            bios_in: stats.bios_in.load(Ordering::Relaxed),
            reads: stats.reads.load(Ordering::Relaxed),
            writes: stats.writes.load(Ordering::Relaxed),
            discards: stats.discards.load(Ordering::Relaxed),
            flushes: stats.flushes.load(Ordering::Relaxed),
            zero_blocks: stats.zero_blocks.load(Ordering::Relaxed),
            dedup_hits: stats.dedup_hits.load(Ordering::Relaxed),
            compressed_fragments: stats.compressed_fragments.load(Ordering::Relaxed),
            advice_timeouts: stats.advice_timeouts.load(Ordering::Relaxed),
            advice_errors: stats.advice_errors.load(Ordering::Relaxed),
            journal_entries: stats.journal_entries.load(Ordering::Relaxed),
            free_blocks: self.inner.depot.free_block_count(),
            read_only: self.inner.read_only.load(Ordering::Acquire),
        }
    }

    /// The current mapping of `lbn`; introspection for tooling and tests.
    pub fn mapping_of(&self, lbn: Lbn) -> Result<DataLocation> {
        self.inner.block_map.get_mapped(lbn)
    }

    /// The reference count of `pbn`; introspection for tooling and tests.
    pub fn reference_count(&self, pbn: Pbn) -> Result<u8> {
        self.inner.depot.reference_count(pbn)
    }

    /// Total logical blocks exposed upstream.
    pub fn total_blocks(&self) -> u64 {
        self.inner.config.logical_blocks
    }
}

impl<D: BlockSet + 'static> Drop for DedupDisk<D> {
    fn drop(&mut self) {
        if !self.inner.read_only.load(Ordering::Acquire) {
            let _ = self.sync();
        }
        self.flusher_stop.store(true, Ordering::Release);
        self.inner.zones.shutdown_all();
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }
    }
}

impl<D: BlockSet + 'static> Debug for DedupDisk<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupDisk")
            .field("logical_blocks", &self.inner.config.logical_blocks)
            .field("free_blocks", &self.inner.depot.free_block_count())
            .field("read_only", &self.inner.read_only)
            .finish()
    }
}

impl<D: BlockSet + 'static> DiskInner<D> {
    fn enqueue(&self, kind: ZoneKind, mut vio: Box<DataVio>, phase: Phase) {
        vio.phase = phase;
        self.zones.handle(kind).send_vio(vio);
    }

    fn fail_vio(&self, mut vio: Box<DataVio>, errno: Errno) {
        vio.set_result(errno);
        self.enqueue(ZoneKind::BioAck, vio, Phase::Acknowledge);
    }

    fn enter_read_only(&self, msg: &str) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            error!("[DedupDisk] entering read-only mode: {msg}");
        }
    }

    fn note_launched(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        *in_flight += 1;
    }

    fn note_finished(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        debug_assert!(*in_flight > 0);
        *in_flight -= 1;
        if *in_flight == 0 {
            self.quiesced.notify_all();
        }
    }

    fn physical_zone_of(&self, pbn: Pbn) -> usize {
        self.depot.zone_of(pbn).unwrap_or(0)
    }

    /// Release a PBN lock and relaunch any waiters it wakes. The only
    /// data-VIOs that ever park on a PBN lock are candidate verifiers
    /// waiting for a READ hold.
    fn release_pbn_lock(&self, zone: usize, pbn: Pbn) {
        let woken = self.pbn_locks[zone].lock().release(pbn);
        for mut vio in woken {
            vio.holds_duplicate_read_lock = true;
            self.enqueue(ZoneKind::Physical(zone), vio, Phase::LockDuplicate);
        }
    }

    /// Take a provisional allocation under a fresh PBN write lock.
    fn allocate_locked(&self, zone: usize) -> Result<Pbn> {
        for _ in 0..16 {
            let pbn = self.depot.allocate(zone)?;
            let mut locks = self.pbn_locks[zone].lock();
            if locks.try_acquire(pbn, PbnLockType::Write) {
                locks.set_provisional_reference(pbn);
                return Ok(pbn);
            }
            drop(locks);
            // Some holder (a dedup verifier, say) still pins this block;
            // put it back and pick another.
            self.depot.release_provisional(pbn)?;
        }
        return_errno_with_msg!(OutOfSpace, "no lockable free block found");
    }

    // === The phase dispatch ===

    fn run_phase(&self, vio: Box<DataVio>) {
        match vio.phase {
            Phase::Launch => self.phase_launch(vio),
            Phase::GetMapped => self.phase_get_mapped(vio),
            Phase::ReadData => self.phase_read_data(vio),
            Phase::Decompress => self.phase_decompress(vio),
            Phase::Overlay => self.phase_overlay(vio),
            Phase::Hash => self.phase_hash(vio),
            Phase::AcquireHashLock => self.phase_acquire_hash_lock(vio),
            Phase::LockDuplicate => self.phase_lock_duplicate(vio),
            Phase::Verify => self.phase_verify(vio),
            Phase::DedupConfirm => self.phase_dedup_confirm(vio),
            Phase::ShareIncrement => self.phase_share_increment(vio),
            Phase::Compress => self.phase_compress(vio),
            Phase::Pack => self.phase_pack(vio),
            Phase::Allocate => self.phase_allocate(vio),
            Phase::WriteData => self.phase_write_data(vio),
            Phase::FinishHashLock => self.phase_finish_hash_lock(vio),
            Phase::RefUpdate => self.phase_ref_update(vio),
            Phase::JournalEntry => self.phase_journal_entry(vio),
            Phase::UpdateBlockMap => self.phase_update_block_map(vio),
            Phase::DecrementOld => self.phase_decrement_old(vio),
            Phase::ReleaseHashLock => self.phase_release_hash_lock(vio),
            Phase::Acknowledge => self.phase_acknowledge(vio),
            Phase::Cleanup => self.phase_cleanup(vio),
        }
    }

    /// Logical zone: serialize on the LBN, then look at the old mapping.
    fn phase_launch(&self, mut vio: Box<DataVio>) {
        if vio.is_trim {
            // Each lap of a discard walk re-derives its slice of the bio.
            let parent = vio.parent.clone().unwrap();
            let range = parent.req.byte_range();
            let block_start = vio.lbn * BLOCK_SIZE as u64;
            let overlap_start = range.start.max(block_start);
            let overlap_end = range.end.min(block_start + BLOCK_SIZE as u64);
            vio.offset = (overlap_start - block_start) as usize;
            vio.length = (overlap_end - overlap_start) as usize;
            vio.is_partial = vio.length < BLOCK_SIZE;
            vio.operation = if vio.is_partial {
                VioOperation::ReadModifyWrite
            } else {
                VioOperation::Discard
            };
        }

        {
            let mut locks = self.logical_locks[vio.logical_zone_id].lock();
            if let Some(waiters) = locks.get_mut(&vio.lbn) {
                waiters.push_back(vio);
                return;
            }
            locks.insert(vio.lbn, VecDeque::new());
        }
        vio.holds_logical_lock = true;
        self.phase_get_mapped(vio);
    }

    /// Logical zone: read the old mapping and branch per operation.
    fn phase_get_mapped(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::GetMapped;
        vio.mapped = match self.block_map.get_mapped(vio.lbn) {
            Ok(loc) => loc,
            Err(e) => {
                if e.errno() == Unrecoverable {
                    self.enter_read_only("block map lookup failed");
                }
                return self.fail_vio(vio, e.errno());
            }
        };

        let old_zone = if vio.mapped.is_allocated() {
            self.physical_zone_of(vio.mapped.pbn)
        } else {
            0
        };

        match vio.operation {
            VioOperation::Read => {
                if !vio.mapped.is_allocated() {
                    // Unmapped or the zero sentinel: all zeroes.
                    vio.data.as_mut_slice().fill(0);
                    self.enqueue(ZoneKind::BioAck, vio, Phase::Acknowledge);
                } else {
                    let zone = self.physical_zone_of(vio.mapped.pbn);
                    self.enqueue(ZoneKind::Physical(zone), vio, Phase::ReadData);
                }
            }
            VioOperation::Discard => {
                vio.new_mapped = DataLocation::UNMAPPED;
                vio.physical_zone_id = old_zone;
                self.enqueue(ZoneKind::Journal, vio, Phase::JournalEntry);
            }
            VioOperation::Write => {
                if vio.is_zero_block {
                    vio.new_mapped = DataLocation::ZERO;
                    vio.physical_zone_id = old_zone;
                    self.enqueue(ZoneKind::Journal, vio, Phase::JournalEntry);
                } else {
                    self.enqueue(ZoneKind::Cpu, vio, Phase::Hash);
                }
            }
            VioOperation::ReadModifyWrite => {
                vio.rmw_pending = true;
                if vio.mapped.is_allocated() {
                    let zone = self.physical_zone_of(vio.mapped.pbn);
                    self.enqueue(ZoneKind::Physical(zone), vio, Phase::ReadData);
                } else {
                    vio.data.as_mut_slice().fill(0);
                    self.enqueue(ZoneKind::Cpu, vio, Phase::Overlay);
                }
            }
        }
    }

    /// Physical zone of the old mapping: fetch the block bytes.
    fn phase_read_data(&self, mut vio: Box<DataVio>) {
        let loc = vio.mapped;
        let res = if loc.state.is_compressed() {
            self.device.read(loc.pbn as BlockId, vio.scratch.as_mut())
        } else {
            self.device.read(loc.pbn as BlockId, vio.data.as_mut())
        };
        if res.is_err() {
            return self.fail_vio(vio, IoFailed);
        }

        if loc.state.is_compressed() {
            self.enqueue(ZoneKind::Cpu, vio, Phase::Decompress);
        } else if vio.rmw_pending {
            self.enqueue(ZoneKind::Cpu, vio, Phase::Overlay);
        } else {
            self.enqueue(ZoneKind::BioAck, vio, Phase::Acknowledge);
        }
    }

    /// CPU zone: inflate the mapped fragment into the data block.
    fn phase_decompress(&self, mut vio: Box<DataVio>) {
        let slot = match vio.mapped.state {
            crate::layers::map::MappingState::Compressed(slot) => slot,
            _ => unreachable!("decompress without a compressed mapping"),
        };
        let v = &mut *vio;
        let res = compression::fragment_of(v.scratch.as_slice(), slot)
            .and_then(|fragment| compression::decompress(fragment, v.data.as_mut_slice()));
        if let Err(e) = res {
            warn!("[DedupDisk] packed fragment for lbn {} is corrupt", vio.lbn);
            return self.fail_vio(vio, e.errno());
        }

        if vio.rmw_pending {
            self.phase_overlay(vio);
        } else {
            self.enqueue(ZoneKind::BioAck, vio, Phase::Acknowledge);
        }
    }

    /// CPU zone: merge the partial payload (or zeroes, for a partial
    /// discard) over the read-filled block, then continue as a write.
    fn phase_overlay(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::Overlay;
        let (offset, length) = (vio.offset, vio.length);
        if vio.is_trim {
            vio.data.as_mut_slice()[offset..offset + length].fill(0);
        } else {
            let parent = vio.parent.clone().unwrap();
            let bio_offset = vio.bio_offset;
            parent.req.access_data_with(|src| {
                vio.data.as_mut_slice()[offset..offset + length]
                    .copy_from_slice(&src[bio_offset..bio_offset + length]);
            });
        }
        vio.rmw_pending = false;

        if vio.data.as_slice().iter().all(|byte| *byte == 0) {
            vio.is_zero_block = true;
            self.stats.zero_blocks.fetch_add(1, Ordering::Relaxed);
            vio.new_mapped = DataLocation::ZERO;
            vio.physical_zone_id = if vio.mapped.is_allocated() {
                self.physical_zone_of(vio.mapped.pbn)
            } else {
                0
            };
            self.enqueue(ZoneKind::Journal, vio, Phase::JournalEntry);
        } else {
            self.phase_hash(vio);
        }
    }

    /// CPU zone: name the content.
    fn phase_hash(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::Hash;
        let name = Fingerprint::of_block(vio.data.as_slice());
        vio.hash_zone_id = name.zone(self.hash_zones.len());
        vio.chunk_name = Some(name);
        self.enqueue(ZoneKind::Hash(vio.hash_zone_id), vio, Phase::AcquireHashLock);
    }

    /// Hash zone: join the fingerprint's lock.
    fn phase_acquire_hash_lock(&self, mut vio: Box<DataVio>) {
        let name = vio.chunk_name.unwrap();
        vio.holds_hash_lock = true;
        let role = self.hash_zones[vio.hash_zone_id].lock().acquire(name, vio);
        match role {
            AcquireRole::Agent(vio) => self.agent_query(vio, name),
            AcquireRole::Parked => {}
            AcquireRole::Sharer(mut vio, duplicate) => {
                vio.duplicate = Some(duplicate);
                vio.is_duplicate = true;
                let zone = self.physical_zone_of(duplicate.pbn);
                self.enqueue(ZoneKind::Physical(zone), vio, Phase::ShareIncrement);
            }
            AcquireRole::Bypass(vio) => {
                vio.compression.cancel();
                self.start_allocation(vio);
            }
        }
    }

    /// Hash zone, agent only: ask the index for advice.
    fn agent_query(&self, mut vio: Box<DataVio>, name: Fingerprint) {
        let outcome = self.index.query(&name, self.config.advice_deadline);
        match outcome {
            QueryOutcome::Advice(candidate) if self.advice_is_plausible(candidate) => {
                {
                    let mut zone = self.hash_zones[vio.hash_zone_id].lock();
                    zone.set_candidate(&name, candidate);
                    zone.set_state(&name, HashLockState::Locking);
                }
                vio.duplicate = Some(candidate);
                let zone = self.physical_zone_of(candidate.pbn);
                self.enqueue(ZoneKind::Physical(zone), vio, Phase::LockDuplicate);
            }
            outcome => {
                match outcome {
                    QueryOutcome::Timeout => {
                        self.stats.advice_timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    QueryOutcome::Error => {
                        self.stats.advice_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                self.hash_zones[vio.hash_zone_id]
                    .lock()
                    .set_state(&name, HashLockState::Writing);
                self.enqueue(ZoneKind::Cpu, vio, Phase::Compress);
            }
        }
    }

    fn advice_is_plausible(&self, candidate: DataLocation) -> bool {
        candidate.is_allocated() && self.depot.is_data_pbn(candidate.pbn)
    }

    /// Physical zone of the candidate: take a READ hold and fetch its
    /// bytes for verification.
    fn phase_lock_duplicate(&self, mut vio: Box<DataVio>) {
        let candidate = vio.duplicate.unwrap();
        let zone = self.physical_zone_of(candidate.pbn);
        if !vio.holds_duplicate_read_lock {
            let mut locks = self.pbn_locks[zone].lock();
            if locks.try_acquire(candidate.pbn, PbnLockType::Read) {
                vio.holds_duplicate_read_lock = true;
            } else {
                vio.phase = Phase::LockDuplicate;
                locks.push_waiter(candidate.pbn, PbnLockType::Read, vio);
                return;
            }
        }

        if self
            .device
            .read(candidate.pbn as BlockId, vio.scratch.as_mut())
            .is_err()
        {
            // Treat an unreadable candidate as a mismatch; the agent
            // falls back to writing fresh.
            vio.is_duplicate = false;
            return self.enqueue(ZoneKind::Hash(vio.hash_zone_id), vio, Phase::DedupConfirm);
        }
        self.enqueue(ZoneKind::Cpu, vio, Phase::Verify);
    }

    /// CPU zone: byte-compare the candidate against our data.
    fn phase_verify(&self, mut vio: Box<DataVio>) {
        let candidate = vio.duplicate.unwrap();
        let v = &mut *vio;
        let matches = match candidate.state {
            crate::layers::map::MappingState::Compressed(slot) => {
                v.compressed.clear();
                v.compressed.resize(BLOCK_SIZE, 0);
                compression::fragment_of(v.scratch.as_slice(), slot)
                    .and_then(|fragment| compression::decompress(fragment, &mut v.compressed))
                    .map(|_| v.compressed[..] == *v.data.as_slice())
                    .unwrap_or(false)
            }
            _ => v.scratch.as_slice() == v.data.as_slice(),
        };
        vio.compressed.clear();
        vio.is_duplicate = matches;
        self.enqueue(ZoneKind::Hash(vio.hash_zone_id), vio, Phase::DedupConfirm);
    }

    /// Hash zone: apply the agent's verification verdict.
    fn phase_dedup_confirm(&self, mut vio: Box<DataVio>) {
        let name = vio.chunk_name.unwrap();
        if vio.is_duplicate {
            let duplicate = vio.duplicate.unwrap();
            let woken = {
                let mut zone = self.hash_zones[vio.hash_zone_id].lock();
                // The candidate READ hold now travels with the lock so
                // sharers may increment before we let go of it.
                zone.set_duplicate_lock(&name, duplicate.pbn);
                zone.resolve(&name, duplicate)
            };
            vio.holds_duplicate_read_lock = false;
            let zone = self.physical_zone_of(duplicate.pbn);
            for mut waiter in woken {
                waiter.duplicate = Some(duplicate);
                waiter.is_duplicate = true;
                self.enqueue(ZoneKind::Physical(zone), waiter, Phase::ShareIncrement);
            }
            self.enqueue(ZoneKind::Physical(zone), vio, Phase::ShareIncrement);
        } else {
            vio.advice_stale = true;
            let candidate = vio.duplicate.take().unwrap();
            if vio.holds_duplicate_read_lock {
                vio.holds_duplicate_read_lock = false;
                self.release_pbn_lock(self.physical_zone_of(candidate.pbn), candidate.pbn);
            }
            self.hash_zones[vio.hash_zone_id]
                .lock()
                .set_state(&name, HashLockState::Writing);
            self.enqueue(ZoneKind::Cpu, vio, Phase::Compress);
        }
    }

    /// Physical zone of the duplicate: add this sharer's reference.
    fn phase_share_increment(&self, mut vio: Box<DataVio>) {
        let duplicate = vio.duplicate.unwrap();
        match self.depot.try_increment(duplicate.pbn) {
            Ok(true) => {
                vio.new_mapped = duplicate;
                vio.ref_taken = true;
                vio.physical_zone_id = self.physical_zone_of(duplicate.pbn);
                self.stats.dedup_hits.fetch_add(1, Ordering::Relaxed);
                self.enqueue(ZoneKind::Journal, vio, Phase::JournalEntry);
            }
            Ok(false) => self.share_refused(vio),
            Err(e) if e.errno() == Protocol => self.share_refused(vio),
            Err(e) => self.fail_vio(vio, e.errno()),
        }
    }

    /// The duplicate saturated (or evaporated); write fresh instead.
    fn share_refused(&self, mut vio: Box<DataVio>) {
        vio.is_duplicate = false;
        vio.duplicate = None;
        vio.advice_stale = true;
        self.enqueue(ZoneKind::Cpu, vio, Phase::Compress);
    }

    /// CPU zone: compress, then decide packer versus plain write.
    fn phase_compress(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::Compress;
        if !vio.compression.advance(VioCompressionStage::Compressing) {
            return self.start_allocation(vio);
        }

        let (size, bytes) = compression::compress(vio.data.as_slice());
        vio.compressed_size = size;
        vio.compressed = bytes;

        if size <= MAX_FRAGMENT_SIZE && vio.compression.advance(VioCompressionStage::Packing) {
            self.enqueue(ZoneKind::Packer, vio, Phase::Pack);
        } else {
            self.start_allocation(vio);
        }
    }

    /// Pick an allocation zone and head there.
    fn start_allocation(&self, mut vio: Box<DataVio>) {
        let zone = self.alloc_cursor.fetch_add(1, Ordering::Relaxed) % self.pbn_locks.len();
        vio.physical_zone_id = zone;
        self.enqueue(ZoneKind::Physical(zone), vio, Phase::Allocate);
    }

    /// Packer zone: stage the fragment.
    fn phase_pack(&self, vio: Box<DataVio>) {
        if vio.compression.may_not_compress() {
            return self.start_allocation(vio);
        }
        let closed = self.packer.lock().add(vio);
        if let Some(bin) = closed {
            self.close_bin(bin);
        }
    }

    /// Close every open bin; called on the flush tick and on drains.
    fn flush_packer_bins(&self) {
        let closed = self.packer.lock().flush();
        for bin in closed {
            self.close_bin(bin);
        }
    }

    /// Write one closed bin as a packed physical block and send every
    /// participant onward with its `(PBN, slot)` mapping.
    fn close_bin(&self, bin: ClosedBin) {
        let vios = bin.vios;
        if vios.is_empty() {
            return;
        }

        let zone = self.alloc_cursor.fetch_add(1, Ordering::Relaxed) % self.pbn_locks.len();
        let pbn = match self.allocate_locked(zone) {
            Ok(pbn) => pbn,
            Err(e) => {
                for vio in vios {
                    self.fail_vio(vio, e.errno());
                }
                return;
            }
        };
        let zone = self.physical_zone_of(pbn);

        let res = (|| -> Result<()> {
            let mut block = Buf::alloc(1)?;
            let fragments: Vec<&[u8]> = vios
                .iter()
                .map(|vio| &vio.compressed[..vio.compressed_size])
                .collect();
            compression::pack_fragments(&fragments, block.as_mut_slice())?;
            self.device.write(pbn as BlockId, block.as_ref())?;
            self.depot.commit_provisional(pbn)
        })();

        if let Err(e) = res {
            let _ = self.depot.release_provisional(pbn);
            self.release_pbn_lock(zone, pbn);
            for vio in vios {
                self.fail_vio(vio, e.errno());
            }
            return;
        }

        self.release_pbn_lock(zone, pbn);
        self.stats
            .compressed_fragments
            .fetch_add(vios.len() as u64, Ordering::Relaxed);

        for (slot, mut vio) in vios.into_iter().enumerate() {
            vio.new_mapped = DataLocation::compressed(pbn, slot as u8);
            // The committed provisional reference belongs to slot zero;
            // the rest take their own on the way through.
            vio.ref_taken = slot == 0;
            vio.physical_zone_id = zone;
            vio.compression.advance(VioCompressionStage::PostPacker);
            self.enqueue(ZoneKind::Physical(zone), vio, Phase::RefUpdate);
        }
    }

    /// Physical zone: allocate and immediately write the data block.
    fn phase_allocate(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::Allocate;
        match self.allocate_locked(vio.physical_zone_id) {
            Ok(pbn) => {
                vio.allocation = Some(pbn);
                vio.new_mapped = DataLocation::uncompressed(pbn);
                self.phase_write_data(vio);
            }
            Err(e) => {
                warn!("[DedupDisk] allocation failed for lbn {}", vio.lbn);
                self.fail_vio(vio, e.errno());
            }
        }
    }

    /// Physical zone: put the block bytes on disk.
    fn phase_write_data(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::WriteData;
        let pbn = vio.new_mapped.pbn;
        if self.device.write(pbn as BlockId, vio.data.as_ref()).is_err() {
            return self.fail_vio(vio, IoFailed);
        }
        self.phase_ref_update(vio);
    }

    /// Physical zone of the new mapping: make the reference real.
    fn phase_ref_update(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::RefUpdate;
        if let Some(pbn) = vio.allocation.take() {
            if let Err(e) = self.depot.commit_provisional(pbn) {
                self.enter_read_only("provisional commitment failed");
                vio.allocation = Some(pbn);
                return self.fail_vio(vio, e.errno());
            }
            vio.ref_taken = true;
            self.release_pbn_lock(vio.physical_zone_id, pbn);
        } else if !vio.ref_taken {
            // A packed participant beyond slot zero.
            match self.depot.try_increment(vio.new_mapped.pbn) {
                Ok(true) => vio.ref_taken = true,
                Ok(false) | Err(_) => {
                    self.enter_read_only("packed block reference went astray");
                    return self.fail_vio(vio, Unrecoverable);
                }
            }
        }

        if vio.holds_hash_lock {
            self.enqueue(ZoneKind::Hash(vio.hash_zone_id), vio, Phase::FinishHashLock);
        } else {
            self.enqueue(ZoneKind::Journal, vio, Phase::JournalEntry);
        }
    }

    /// Hash zone: publish the written location, refresh the index, and
    /// relaunch same-name waiters as sharers.
    fn phase_finish_hash_lock(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::FinishHashLock;
        let name = vio.chunk_name.unwrap();
        let new_mapped = vio.new_mapped;

        let woken = self.hash_zones[vio.hash_zone_id].lock().resolve(&name, new_mapped);
        let share_zone = self.physical_zone_of(new_mapped.pbn);
        for mut waiter in woken {
            waiter.duplicate = Some(new_mapped);
            waiter.is_duplicate = true;
            self.enqueue(ZoneKind::Physical(share_zone), waiter, Phase::ShareIncrement);
        }

        if vio.advice_stale {
            self.index.update(&name, new_mapped);
        } else {
            self.index.post(&name, new_mapped);
        }
        self.enqueue(ZoneKind::Journal, vio, Phase::JournalEntry);
    }

    /// Journal zone: record the intended mapping change.
    fn phase_journal_entry(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::JournalEntry;
        if self.read_only.load(Ordering::Acquire) {
            return self.fail_vio(vio, ReadOnly);
        }
        if !self.journal.has_space() {
            self.journal_waiters.lock().push_back(vio);
            return;
        }

        let entry = JournalEntry {
            lbn: vio.lbn,
            old: vio.mapped,
            new: vio.new_mapped,
        };
        match self
            .journal
            .append(entry, vio.logical_zone_id, vio.physical_zone_id)
        {
            Ok(point) => {
                vio.journal_point = Some(point);
                vio.holds_logical_pin = true;
                vio.holds_physical_pin = true;
                self.stats.journal_entries.fetch_add(1, Ordering::Relaxed);
                self.enqueue(
                    ZoneKind::Logical(vio.logical_zone_id),
                    vio,
                    Phase::UpdateBlockMap,
                );
            }
            Err(e) => {
                self.enter_read_only("recovery journal append failed");
                self.fail_vio(vio, e.errno());
            }
        }
    }

    /// Journal zone task: advance the head and revive parked appends.
    fn journal_reap(&self) {
        self.journal.reap();
        self.journal.lock_counter().acknowledge_unlock();
        // Catch any release edge that raced the notification window.
        self.journal.reap();

        loop {
            if !self.journal.has_space() {
                break;
            }
            let Some(vio) = self.journal_waiters.lock().pop_front() else {
                break;
            };
            self.phase_journal_entry(vio);
        }
    }

    /// Logical zone: make the new mapping visible.
    fn phase_update_block_map(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::UpdateBlockMap;
        let mut failed = None;
        if let Err(e) = self.block_map.put_mapped(vio.lbn, vio.new_mapped) {
            self.enter_read_only("block map update failed");
            failed = Some(e.errno());
        }

        // The leaf write went through (or never will); the journal no
        // longer needs to pin this zone's update.
        if vio.holds_logical_pin {
            let point = vio.journal_point.unwrap();
            self.journal
                .lock_counter()
                .release(point.lock, ZoneType::Logical, vio.logical_zone_id);
            vio.holds_logical_pin = false;
        }

        if let Some(errno) = failed {
            return self.fail_vio(vio, errno);
        }
        let zone = if vio.mapped.is_allocated() {
            self.physical_zone_of(vio.mapped.pbn)
        } else {
            vio.physical_zone_id
        };
        self.enqueue(ZoneKind::Physical(zone), vio, Phase::DecrementOld);
    }

    /// Physical zone of the old mapping: drop the replaced reference.
    fn phase_decrement_old(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::DecrementOld;
        if vio.result.is_none() && vio.mapped.is_allocated() {
            if let Err(e) = self.depot.decrement(vio.mapped.pbn) {
                self.enter_read_only("stale reference decrement failed");
                vio.set_result(e.errno());
            }
        }
        if vio.holds_physical_pin {
            let point = vio.journal_point.unwrap();
            self.journal
                .lock_counter()
                .release(point.lock, ZoneType::Physical, vio.physical_zone_id);
            vio.holds_physical_pin = false;
        }

        if vio.holds_hash_lock {
            self.enqueue(ZoneKind::Hash(vio.hash_zone_id), vio, Phase::ReleaseHashLock);
        } else {
            self.enqueue(ZoneKind::BioAck, vio, Phase::Acknowledge);
        }
    }

    /// Hash zone: detach from the hash lock.
    fn phase_release_hash_lock(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::ReleaseHashLock;
        self.detach_hash_lock(&mut vio);
        self.enqueue(ZoneKind::BioAck, vio, Phase::Acknowledge);
    }

    fn detach_hash_lock(&self, vio: &mut DataVio) {
        if !vio.holds_hash_lock {
            return;
        }
        let name = vio.chunk_name.unwrap();
        let outcome = self.hash_zones[vio.hash_zone_id].lock().release(&name);
        vio.holds_hash_lock = false;
        if let ReleaseOutcome::Destroyed(Some(pbn)) = outcome {
            self.release_pbn_lock(self.physical_zone_of(pbn), pbn);
        }
    }

    /// Bio-ack zone: complete the upstream request (or continue a
    /// discard walk silently).
    fn phase_acknowledge(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::Acknowledge;
        let mut result = match vio.result {
            Some(errno) => Err(Error::new(errno)),
            None => Ok(()),
        };

        let parent = vio.parent.clone();
        let wants_durability = vio.flush_after
            || parent
                .as_ref()
                .map(|share| share.req.flags().contains(BioFlags::SYNC))
                .unwrap_or(false);
        let is_write = vio.operation != VioOperation::Read;
        if result.is_ok() && is_write && wants_durability {
            if let Err(e) = self.journal.flush().and_then(|_| self.device.flush()) {
                vio.set_result(e.errno());
                result = Err(e);
            }
        }

        if vio.operation == VioOperation::Read && result.is_ok() {
            let (offset, length, bio_offset) = (vio.offset, vio.length, vio.bio_offset);
            if let Some(share) = parent.as_ref() {
                share.req.access_mut_data_with(|dst| {
                    dst[bio_offset..bio_offset + length]
                        .copy_from_slice(&vio.data.as_slice()[offset..offset + length]);
                });
            }
        }

        let mid_walk = vio.is_trim && vio.result.is_none() && vio.remaining_discard > 1;
        if !mid_walk {
            if let Some(share) = vio.parent.take() {
                share.complete_child(result);
            }
        }

        self.enqueue(ZoneKind::Logical(vio.logical_zone_id), vio, Phase::Cleanup);
    }

    /// Logical zone: let go of everything still held, continue a discard
    /// walk, or return to the pool.
    fn phase_cleanup(&self, mut vio: Box<DataVio>) {
        vio.phase = Phase::Cleanup;
        if vio.result.is_some() {
            self.release_failed_vio_resources(&mut vio);
        }

        if vio.holds_logical_lock {
            vio.holds_logical_lock = false;
            let waiters = self.logical_locks[vio.logical_zone_id]
                .lock()
                .remove(&vio.lbn);
            if let Some(waiters) = waiters {
                // Relaunch in arrival order; the first re-takes the lock.
                for waiter in waiters {
                    self.enqueue(ZoneKind::Logical(vio.logical_zone_id), waiter, Phase::Launch);
                }
            }
        }

        if vio.is_trim && vio.result.is_none() && vio.remaining_discard > 1 {
            vio.continue_discard();
            vio.logical_zone_id = self.block_map.zone_of(vio.lbn);
            self.enqueue(ZoneKind::Logical(vio.logical_zone_id), vio, Phase::Launch);
            return;
        }

        self.pool.release(vio);
        self.note_finished();
    }

    /// Failure path: release whatever the data-VIO still holds. The
    /// normal path releases each resource in its owning zone; an aborted
    /// data-VIO lets go here, through the shared-state locks.
    fn release_failed_vio_resources(&self, vio: &mut DataVio) {
        if vio.holds_hash_lock {
            let name = vio.chunk_name.unwrap();
            // An agent that dies mid-decision turns its waiters loose as
            // independent writers.
            let woken = {
                let mut zone = self.hash_zones[vio.hash_zone_id].lock();
                let undecided = !matches!(
                    zone.state(&name),
                    Some(HashLockState::Updating) | Some(HashLockState::Bypassing) | None
                );
                if undecided {
                    zone.bypass(&name)
                } else {
                    Vec::new()
                }
            };
            for waiter in woken {
                waiter.compression.cancel();
                self.start_allocation(waiter);
            }
            self.detach_hash_lock(vio);
        }

        if vio.holds_duplicate_read_lock {
            vio.holds_duplicate_read_lock = false;
            if let Some(candidate) = vio.duplicate {
                self.release_pbn_lock(self.physical_zone_of(candidate.pbn), candidate.pbn);
            }
        }

        if let Some(pbn) = vio.allocation.take() {
            let _ = self.depot.release_provisional(pbn);
            self.release_pbn_lock(self.physical_zone_of(pbn), pbn);
        }

        // A reference taken but never journaled would leak the block.
        if vio.ref_taken && vio.journal_point.is_none() && vio.new_mapped.is_allocated() {
            let _ = self.depot.decrement(vio.new_mapped.pbn);
            vio.ref_taken = false;
        }

        if let Some(point) = vio.journal_point {
            if vio.holds_logical_pin {
                self.journal
                    .lock_counter()
                    .release(point.lock, ZoneType::Logical, vio.logical_zone_id);
                vio.holds_logical_pin = false;
            }
            if vio.holds_physical_pin {
                self.journal
                    .lock_counter()
                    .release(point.lock, ZoneType::Physical, vio.physical_zone_id);
                vio.holds_physical_pin = false;
            }
        }
    }
}

impl<D> Debug for DiskInner<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskInner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
