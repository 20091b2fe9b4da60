//! Deciding where the next ledger record goes.
//!
//! Appending forever grows the ledger with the total number of allocations,
//! and searching for a hole on every call is O(n) once the ledger is sparse.
//! So we append while the ledger is dense (or while the backing store has room
//! anyway), and only once it has thinned out below the expansion ratio do we
//! go looking for a vacated slot, starting wherever the last search stopped.

use crate::util::num::occupancy;

use super::ledger::AllocationRecord;

pub const DEFAULT_EXPANSION_RATIO: f64 = 0.75;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotChoice {
    Append,
    Reuse(usize),
}

/// What the policy needs to know about the ledger at the moment of the call
#[derive(Clone, Copy, Debug)]
pub struct LedgerShape {
    pub len: usize,
    pub capacity: usize,
    pub live_blocks: u64,
    /// `false` when freed slots are kept for history and must not be recycled
    pub reuse_allowed: bool,
}

#[derive(Debug)]
pub struct SlotReusePolicy {
    expansion_ratio: f64,
    cursor: usize,
    scan_steps: u64,
}

impl SlotReusePolicy {
    pub fn new(expansion_ratio: f64) -> Self {
        debug_assert!(expansion_ratio > 0.0 && expansion_ratio < 1.0);
        Self {
            expansion_ratio,
            cursor: 0,
            scan_steps: 0,
        }
    }

    pub fn choose(&mut self, shape: LedgerShape, records: &[AllocationRecord]) -> SlotChoice {
        debug_assert_eq!(shape.len, records.len());
        if !shape.reuse_allowed
            || shape.len < shape.capacity
            || occupancy(shape.live_blocks, shape.len) >= self.expansion_ratio
        {
            return SlotChoice::Append;
        }
        self.scan(records)
    }

    /// Circular scan for the next vacated slot. Worst case O(n), but the ratio
    /// check above means at least a quarter (by default) of the slots we look
    /// at are holes.
    fn scan(&mut self, records: &[AllocationRecord]) -> SlotChoice {
        let len = records.len();
        let start = self.cursor % len;
        for offset in 0..len {
            let index = (start + offset) % len;
            self.scan_steps += 1;
            if records[index].is_vacated() {
                self.cursor = (index + 1) % len;
                return SlotChoice::Reuse(index);
            }
        }
        SlotChoice::Append
    }

    /// Indices moved, start over
    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Total slots inspected by all scans so far
    pub fn scan_steps(&self) -> u64 {
        self.scan_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    fn records(live: &[bool]) -> Vec<AllocationRecord> {
        live.iter()
            .map(|&live| {
                if live {
                    AllocationRecord::live("t", NonNull::dangling(), 1)
                } else {
                    AllocationRecord::vacated()
                }
            })
            .collect()
    }

    fn shape(records: &[AllocationRecord], capacity: usize) -> LedgerShape {
        LedgerShape {
            len: records.len(),
            capacity,
            live_blocks: records.iter().filter(|r| r.is_live()).count() as u64,
            reuse_allowed: true,
        }
    }

    #[test]
    fn appends_into_spare_capacity() {
        let mut policy = SlotReusePolicy::new(DEFAULT_EXPANSION_RATIO);
        let r = records(&[false, false, true]);
        assert_eq!(policy.choose(shape(&r, 8), &r), SlotChoice::Append);
    }

    #[test]
    fn appends_while_dense() {
        let mut policy = SlotReusePolicy::new(DEFAULT_EXPANSION_RATIO);
        let r = records(&[true, true, true, false]);
        assert_eq!(policy.choose(shape(&r, 4), &r), SlotChoice::Append);
    }

    #[test]
    fn empty_ledger_appends() {
        let mut policy = SlotReusePolicy::new(DEFAULT_EXPANSION_RATIO);
        assert_eq!(policy.choose(shape(&[], 0), &[]), SlotChoice::Append);
    }

    #[test]
    fn sparse_ledger_reuses_and_rotates() {
        let mut policy = SlotReusePolicy::new(DEFAULT_EXPANSION_RATIO);
        let mut r = records(&[true, false, true, false]);
        assert_eq!(policy.choose(shape(&r, 4), &r), SlotChoice::Reuse(1));
        assert_eq!(policy.cursor(), 2);
        r[1] = AllocationRecord::live("t", NonNull::dangling(), 1);
        // 3/4 live is at the ratio, so this one appends
        assert_eq!(policy.choose(shape(&r, 4), &r), SlotChoice::Append);

        let r = records(&[false, true, true, false]);
        assert_eq!(policy.choose(shape(&r, 4), &r), SlotChoice::Reuse(3));
        assert_eq!(policy.cursor(), 0);
        assert_eq!(policy.choose(shape(&r, 4), &r), SlotChoice::Reuse(0));
    }

    #[test]
    fn history_mode_never_reuses() {
        let mut policy = SlotReusePolicy::new(DEFAULT_EXPANSION_RATIO);
        let r = records(&[false, false, false, false]);
        let shape = LedgerShape {
            reuse_allowed: false,
            ..shape(&r, 4)
        };
        assert_eq!(policy.choose(shape, &r), SlotChoice::Append);
        assert_eq!(policy.scan_steps(), 0);
    }
}
