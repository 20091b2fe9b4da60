//! The allocation ledger: one record per tracked allocation, indexed by the
//! slot number that the envelope header carries.

use std::ptr::NonNull;

use log::debug;
use serde::Serialize;

use super::{
    counters::Counters,
    reuse::{LedgerShape, SlotChoice, SlotReusePolicy},
};

pub const DEFAULT_COMPACTION_THRESHOLD: usize = 100;

/// Bookkeeping for one allocation.
///
/// A record with no pointer is *vacated* and may be handed out again. A
/// *retired* record belongs to a freed allocation that we keep around for the
/// final report (track-all mode), so it keeps its pointer but is not live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    tag: String,
    pointer: Option<NonNull<u8>>,
    size: u32,
    retired: bool,
}

impl AllocationRecord {
    pub fn live(tag: &str, pointer: NonNull<u8>, size: u32) -> Self {
        Self {
            tag: tag.to_owned(),
            pointer: Some(pointer),
            size,
            retired: false,
        }
    }

    pub const fn vacated() -> Self {
        Self {
            tag: String::new(),
            pointer: None,
            size: 0,
            retired: false,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The payload pointer that was handed to the caller
    pub fn pointer(&self) -> Option<NonNull<u8>> {
        self.pointer
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_vacated(&self) -> bool {
        self.pointer.is_none()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn is_live(&self) -> bool {
        self.pointer.is_some() && !self.retired
    }
}

/// What happens to a record once its allocation is freed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retention {
    /// Drop the tag, recycle the slot, and compact once `compaction_threshold`
    /// slots are vacant
    Reclaim { compaction_threshold: usize },
    /// Keep every record for the whole run
    History,
}

/// Why a slot index from a header was rejected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupError {
    OutOfRange { index: u32, len: usize },
    /// The slot is vacated or retired: its allocation was already freed
    NotLive { index: u32 },
    /// The slot is live, but for a different block
    Mismatch { index: u32 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub len: usize,
    pub capacity: usize,
    /// Records inspected by `free()` lookups
    pub slots_probed: u64,
    /// Records inspected by reuse scans
    pub scan_steps: u64,
    pub compactions: u64,
}

#[derive(Debug)]
pub struct Ledger {
    records: Vec<AllocationRecord>,
    policy: SlotReusePolicy,
    retention: Retention,
    counters: Counters,
    slots_probed: u64,
    compactions: u64,
}

impl Ledger {
    pub fn new(retention: Retention, expansion_ratio: f64) -> Self {
        Self {
            records: Vec::new(),
            policy: SlotReusePolicy::new(expansion_ratio),
            retention,
            counters: Counters::default(),
            slots_probed: 0,
            compactions: 0,
        }
    }

    /// Store a record for a new allocation and return its slot. Returns
    /// `None` only if the ledger has outgrown what a header can address.
    pub fn acquire(&mut self, tag: &str, pointer: NonNull<u8>, size: u32) -> Option<u32> {
        let index = self.acquire_slot();
        let Ok(slot) = u32::try_from(index) else {
            if index + 1 == self.records.len() {
                self.records.pop();
            }
            return None;
        };
        debug_assert!(self.records[index].is_vacated());
        self.records[index] = AllocationRecord::live(tag, pointer, size);
        self.counters.record_malloc(size);
        Some(slot)
    }

    /// An index that is safe to overwrite: either fresh at the end, or a
    /// vacated slot picked by the reuse policy
    fn acquire_slot(&mut self) -> usize {
        let shape = LedgerShape {
            len: self.records.len(),
            capacity: self.records.capacity(),
            live_blocks: self.counters.live_blocks,
            reuse_allowed: matches!(self.retention, Retention::Reclaim { .. }),
        };
        match self.policy.choose(shape, &self.records) {
            SlotChoice::Reuse(index) => index,
            SlotChoice::Append => {
                self.records.push(AllocationRecord::vacated());
                self.records.len() - 1
            }
        }
    }

    /// # Panics
    ///
    /// If `index` is out of range. Indices come from `acquire()` or from a
    /// header that already went through `lookup()`.
    pub fn record_at(&self, index: usize) -> &AllocationRecord {
        &self.records[index]
    }

    /// Check that slot `index` is live and owns `pointer`. Looks at exactly one
    /// record.
    pub fn lookup(&mut self, index: u32, pointer: NonNull<u8>) -> Result<&AllocationRecord, LookupError> {
        let len = self.records.len();
        let Some(record) = self.records.get(index as usize) else {
            return Err(LookupError::OutOfRange { index, len });
        };
        self.slots_probed += 1;
        if !record.is_live() {
            return Err(LookupError::NotLive { index });
        }
        if record.pointer != Some(pointer) {
            return Err(LookupError::Mismatch { index });
        }
        Ok(record)
    }

    /// Mark the allocation in slot `index` as freed, returning its size
    pub fn vacate(&mut self, index: usize) -> u32 {
        let record = &mut self.records[index];
        debug_assert!(record.is_live());
        let size = record.size;
        match self.retention {
            Retention::Reclaim { .. } => *record = AllocationRecord::vacated(),
            Retention::History => record.retired = true,
        }
        self.counters.record_free(size);
        size
    }

    pub fn vacated_slots(&self) -> usize {
        self.records.len() - self.live_slots()
    }

    fn live_slots(&self) -> usize {
        // `live_blocks` can only exceed `len` if the counters are corrupt
        (self.counters.live_blocks as usize).min(self.records.len())
    }

    pub fn needs_compaction(&self) -> bool {
        match self.retention {
            Retention::Reclaim {
                compaction_threshold,
            } => self.vacated_slots() >= compaction_threshold,
            Retention::History => false,
        }
    }

    /// Move live records to the front, keeping their relative order, and
    /// truncate. `rebind` is called with the payload pointer and new slot of
    /// every record that moved, so that its header can be updated.
    pub fn compact(&mut self, mut rebind: impl FnMut(NonNull<u8>, u32)) {
        let before = self.records.len();
        let mut dest = 0;
        for src in 0..before {
            let Some(pointer) = self.records[src].pointer else {
                continue;
            };
            if src != dest {
                self.records.swap(src, dest);
                // `dest < src < len`, and `len` fit in a `u32` when `src` was
                // acquired
                rebind(pointer, dest as u32);
            }
            dest += 1;
        }
        self.records.truncate(dest);
        self.policy.reset_cursor();
        self.compactions += 1;
        debug!(
            target: "tagalloc::ledger",
            "compacted ledger from {before} to {dest} slots"
        );
    }

    pub fn records(&self) -> &[AllocationRecord] {
        &self.records
    }

    pub fn live_records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.iter().filter(|record| record.is_live())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            len: self.records.len(),
            capacity: self.records.capacity(),
            slots_probed: self.slots_probed,
            scan_steps: self.policy.scan_steps(),
            compactions: self.compactions,
        }
    }
}
