// SPDX-License-Identifier: MPL-2.0

//! The recovery journal: a ring of sequence-numbered blocks recording
//! every intended mapping change before it reaches the block map.
//!
//! An entry is `(lbn, old location, new location)`. Entries accumulate in
//! the open tail block; the tail is committed to the ring when it fills,
//! on an explicit commit, or on a flush. A committed block stays pinned
//! through the lock counter until every metadata update it records has
//! been persisted, after which the journal head may reap it and the ring
//! slot becomes reusable.

use super::lock_counter::{LockCounter, ZoneType};
use crate::{
    layers::{
        bio::{BlockSet, Buf},
        map::{pack_entry, unpack_entry, DataLocation, Lbn, ENTRY_SIZE},
    },
    os::Mutex,
    prelude::*,
};

const BLOCK_MAGIC: u32 = 0x4a52_4442;
const BLOCK_HEADER_SIZE: usize = 32;
const RECORD_SIZE: usize = 8 + 2 * ENTRY_SIZE;

/// Entries a single journal block can hold.
pub const ENTRIES_PER_BLOCK: usize = (BLOCK_SIZE - BLOCK_HEADER_SIZE) / RECORD_SIZE;

/// One intended mapping change.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct JournalEntry {
    pub lbn: Lbn,
    pub old: DataLocation,
    pub new: DataLocation,
}

impl JournalEntry {
    fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.lbn.to_le_bytes());
        out[8..8 + ENTRY_SIZE].copy_from_slice(&pack_entry(self.old));
        out[8 + ENTRY_SIZE..RECORD_SIZE].copy_from_slice(&pack_entry(self.new));
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let lbn = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let mut packed = [0u8; ENTRY_SIZE];
        packed.copy_from_slice(&bytes[8..8 + ENTRY_SIZE]);
        let old = unpack_entry(&packed)?;
        packed.copy_from_slice(&bytes[8 + ENTRY_SIZE..RECORD_SIZE]);
        let new = unpack_entry(&packed)?;
        Ok(Self { lbn, old, new })
    }
}

/// Where an appended entry landed: its block sequence number and the
/// lock-counter slot pinning that block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct JournalPoint {
    pub sequence: u64,
    pub lock: usize,
}

struct TailState {
    /// Sequence number of the open tail block.
    tail_seq: u64,
    /// Oldest sequence number not yet reaped.
    head_seq: u64,
    /// Entries staged in the open tail block.
    entry_count: usize,
    tail_buf: Buf,
}

/// The journal itself. All mutating calls come from the journal zone.
pub struct RecoveryJournal<D> {
    region: D,
    lock_counter: Arc<LockCounter>,
    state: Mutex<TailState>,
}

impl<D: BlockSet> RecoveryJournal<D> {
    /// Open the journal over `region`, starting at `next_seq`.
    pub fn new(region: D, lock_counter: Arc<LockCounter>, next_seq: u64) -> Result<Self> {
        if region.nblocks() < lock_counter.locks() {
            return_errno_with_msg!(InvalidArgs, "journal region smaller than the lock ring");
        }
        Ok(Self {
            region,
            lock_counter,
            state: Mutex::new(TailState {
                tail_seq: next_seq,
                head_seq: next_seq,
                entry_count: 0,
                tail_buf: Buf::alloc(1)?,
            }),
        })
    }

    /// The lock counter pinning this journal's blocks.
    pub fn lock_counter(&self) -> &Arc<LockCounter> {
        &self.lock_counter
    }

    /// Whether a new entry can be appended without waiting for a reap.
    pub fn has_space(&self) -> bool {
        let state = self.state.lock();
        (state.tail_seq - state.head_seq) < self.lock_counter.locks() as u64
    }

    /// Append an entry, pinning its block for the journal zone and for the
    /// data-VIO's logical and physical zones.
    pub fn append(
        &self,
        entry: JournalEntry,
        logical_zone: usize,
        physical_zone: usize,
    ) -> Result<JournalPoint> {
        let mut state = self.state.lock();
        if (state.tail_seq - state.head_seq) >= self.lock_counter.locks() as u64 {
            return_errno_with_msg!(Protocol, "appended to a full journal ring");
        }

        let sequence = state.tail_seq;
        let lock = self.slot(sequence);
        if state.entry_count == 0 {
            self.lock_counter.reset_lock(lock);
        }

        let offset = BLOCK_HEADER_SIZE + state.entry_count * RECORD_SIZE;
        entry.encode(&mut state.tail_buf.as_mut_slice()[offset..offset + RECORD_SIZE]);
        state.entry_count += 1;

        self.lock_counter.acquire(lock, ZoneType::Journal, 0);
        self.lock_counter.acquire(lock, ZoneType::Logical, logical_zone);
        self.lock_counter.acquire(lock, ZoneType::Physical, physical_zone);

        if state.entry_count == ENTRIES_PER_BLOCK {
            self.commit_locked(&mut state)?;
        }
        Ok(JournalPoint { sequence, lock })
    }

    /// Commit the open tail block, if it holds any entries.
    pub fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.entry_count > 0 {
            self.commit_locked(&mut state)?;
        }
        Ok(())
    }

    /// Commit and force the ring down to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.commit()?;
        self.region.flush()
    }

    /// Advance the head over committed, unpinned blocks. Returns how many
    /// blocks were reaped.
    pub fn reap(&self) -> usize {
        let mut state = self.state.lock();
        let mut reaped = 0;
        while state.head_seq < state.tail_seq {
            let lock = self.slot(state.head_seq);
            if !self.lock_counter.is_unlocked(lock) {
                break;
            }
            state.head_seq += 1;
            reaped += 1;
        }
        reaped
    }

    /// The sequence number the next committed block will take; entries at
    /// or past this point are the replayable suffix after a crash.
    pub fn next_commit_seq(&self) -> u64 {
        self.state.lock().tail_seq
    }

    fn slot(&self, seq: u64) -> usize {
        (seq % self.lock_counter.locks() as u64) as usize
    }

    fn commit_locked(&self, state: &mut TailState) -> Result<()> {
        let seq = state.tail_seq;
        let entries = state.entry_count;
        {
            let header = state.tail_buf.as_mut_slice();
            header[0..4].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
            header[4..12].copy_from_slice(&seq.to_le_bytes());
            header[12..14].copy_from_slice(&(entries as u16).to_le_bytes());
        }

        let pos = (seq % self.region.nblocks() as u64) as BlockId;
        self.region.write(pos, state.tail_buf.as_ref())?;

        // The entries are now recorded; drop the journal-zone pins taken
        // at append time.
        let lock = self.slot(seq);
        for _ in 0..entries {
            self.lock_counter.release(lock, ZoneType::Journal, 0);
        }

        state.tail_seq += 1;
        state.entry_count = 0;
        state.tail_buf.as_mut_slice().fill(0);
        Ok(())
    }
}

impl<D> Debug for RecoveryJournal<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RecoveryJournal")
            .field("head_seq", &state.head_seq)
            .field("tail_seq", &state.tail_seq)
            .field("staged_entries", &state.entry_count)
            .finish()
    }
}

/// Scan `region` for journal blocks written at or after `from_seq` and
/// feed their entries, in sequence order, to `visit`. Returns the highest
/// sequence number seen anywhere in the ring (or `from_seq - 1` if none),
/// so the journal can resume past every block ever written.
pub fn replay<D, F>(region: &D, from_seq: u64, mut visit: F) -> Result<u64>
where
    D: BlockSet,
    F: FnMut(JournalEntry) -> Result<()>,
{
    let mut blocks = Vec::new();
    let mut max_seq = from_seq.saturating_sub(1);

    let mut buf = Buf::alloc(1)?;
    for pos in 0..region.nblocks() {
        region.read(pos, buf.as_mut())?;
        let slice = buf.as_slice();
        let magic = u32::from_le_bytes(slice[0..4].try_into().unwrap());
        if magic != BLOCK_MAGIC {
            continue;
        }
        let seq = u64::from_le_bytes(slice[4..12].try_into().unwrap());
        let entries = u16::from_le_bytes(slice[12..14].try_into().unwrap()) as usize;
        if entries > ENTRIES_PER_BLOCK {
            return_errno_with_msg!(Unrecoverable, "journal block claims too many entries");
        }
        max_seq = max_seq.max(seq);
        if seq < from_seq {
            continue;
        }

        let mut parsed = Vec::with_capacity(entries);
        for nth in 0..entries {
            let offset = BLOCK_HEADER_SIZE + nth * RECORD_SIZE;
            parsed.push(JournalEntry::decode(&slice[offset..offset + RECORD_SIZE])?);
        }
        blocks.push((seq, parsed));
    }

    blocks.sort_by_key(|(seq, _)| *seq);
    for (_, entries) in blocks {
        for entry in entries {
            visit(entry)?;
        }
    }
    Ok(max_seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{bio::MemDisk, map::DataLocation};

    fn entry(lbn: Lbn, new_pbn: u64) -> JournalEntry {
        JournalEntry {
            lbn,
            old: DataLocation::UNMAPPED,
            new: DataLocation::uncompressed(new_pbn),
        }
    }

    fn new_journal(nblocks: usize, locks: usize) -> RecoveryJournal<MemDisk> {
        let region = MemDisk::create(nblocks).unwrap();
        let counter = Arc::new(LockCounter::new(locks, 1, 1));
        RecoveryJournal::new(region, counter, 1).unwrap()
    }

    #[test]
    fn append_pins_all_three_zone_types() {
        let journal = new_journal(8, 4);
        let point = journal.append(entry(5, 100), 0, 0).unwrap();
        assert_eq!(point.sequence, 1);
        assert!(!journal.lock_counter().is_unlocked(point.lock));

        journal.commit().unwrap();
        // Journal pin is gone, but the zones still hold the block.
        assert!(!journal.lock_counter().is_unlocked(point.lock));

        journal.lock_counter().release(point.lock, ZoneType::Logical, 0);
        journal.lock_counter().release(point.lock, ZoneType::Physical, 0);
        assert!(journal.lock_counter().is_unlocked(point.lock));
        assert_eq!(journal.reap(), 1);
    }

    #[test]
    fn ring_refuses_appends_past_unreaped_blocks() {
        let journal = new_journal(8, 2);
        let mut points = Vec::new();
        for nth in 0..2 {
            points.push(journal.append(entry(nth, 10 + nth), 0, 0).unwrap());
            journal.commit().unwrap();
        }
        assert!(!journal.has_space());
        assert!(journal.append(entry(9, 9), 0, 0).is_err());

        for point in &points {
            journal.lock_counter().release(point.lock, ZoneType::Logical, 0);
            journal.lock_counter().release(point.lock, ZoneType::Physical, 0);
            journal.lock_counter().acknowledge_unlock();
        }
        assert_eq!(journal.reap(), 2);
        assert!(journal.has_space());
    }

    #[test]
    fn replay_returns_suffix_in_order() {
        let region = MemDisk::create(8).unwrap();
        let counter = Arc::new(LockCounter::new(4, 1, 1));
        let journal = RecoveryJournal::new(region.clone(), counter, 1).unwrap();

        for nth in 0..3u64 {
            let point = journal.append(entry(nth, 50 + nth), 0, 0).unwrap();
            journal.commit().unwrap();
            journal.lock_counter().release(point.lock, ZoneType::Logical, 0);
            journal.lock_counter().release(point.lock, ZoneType::Physical, 0);
            journal.lock_counter().acknowledge_unlock();
        }
        journal.reap();

        // Replay from sequence 2: only the last two blocks apply.
        let mut seen = Vec::new();
        let max_seq = replay(&region, 2, |e| {
            seen.push((e.lbn, e.new.pbn));
            Ok(())
        })
        .unwrap();
        assert_eq!(max_seq, 3);
        assert_eq!(seen, vec![(1, 51), (2, 52)]);
    }

    #[test]
    fn staged_entries_commit_on_fill() {
        let journal = new_journal(8, 4);
        for nth in 0..ENTRIES_PER_BLOCK as u64 {
            journal.append(entry(nth, nth), 0, 0).unwrap();
        }
        // The tail auto-committed, so the next append opens sequence 2.
        let point = journal.append(entry(999, 999), 0, 0).unwrap();
        assert_eq!(point.sequence, 2);
    }
}
