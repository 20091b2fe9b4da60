use log::error;
use serde::Serialize;

use crate::util::hint::cold;

/// Running totals kept by every profiling mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub malloc_calls: u64,
    pub free_calls: u64,
    /// Blocks currently allocated
    pub live_blocks: u64,
    /// Bytes currently allocated, headers not included
    pub live_bytes: u64,
    /// High-water mark of `live_bytes`
    pub peak_bytes: u64,
}

impl Counters {
    pub fn record_malloc(&mut self, size: u32) {
        self.malloc_calls += 1;
        self.live_blocks += 1;
        self.live_bytes += u64::from(size);
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);
    }

    /// Returns `false` if a live counter would have gone negative. The counter
    /// is clamped to zero in that case, since it means our state is already
    /// wrong and there is nothing better to do than say so.
    pub fn record_free(&mut self, size: u32) -> bool {
        self.free_calls += 1;
        let blocks = self.live_blocks.checked_sub(1);
        let bytes = self.live_bytes.checked_sub(u64::from(size));
        self.live_blocks = blocks.unwrap_or(0);
        self.live_bytes = bytes.unwrap_or(0);
        if blocks.is_none() || bytes.is_none() {
            return cold(|| {
                error!(
                    target: "tagalloc::ledger",
                    "live counters underflowed freeing {size} bytes, profiler state is corrupted"
                );
                false
            });
        }
        true
    }

    /// `malloc_calls != free_calls` means a leak or a double free, even when
    /// byte totals balance
    pub fn calls_mismatched(&self) -> bool {
        self.malloc_calls != self.free_calls
    }
}
