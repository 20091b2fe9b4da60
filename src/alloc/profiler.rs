//! The profiler facade: `malloc()`, `free()` and `shutdown_report()`.

use std::{alloc::Layout, ptr::NonNull};

use log::{error, trace};

use crate::{
    config::{ProfileMode, ProfilerConfig},
    error::{AllocFailure, ConfigError, FreeFailure},
    report::ProfileReport,
    util::hint::cold,
};

use super::{
    buckets::BucketTable,
    counters::Counters,
    envelope::{Binding, Envelope, HeaderError},
    heap::{RawAllocator, SystemHeap},
    ledger::{Ledger, LedgerStats, LookupError, Retention},
};

const TARGET: &str = "tagalloc::profiler";

#[derive(Debug)]
enum Tracking {
    Off,
    Ledger(Ledger),
    Detailed {
        table: BucketTable,
        counters: Counters,
    },
}

/// A tagged allocation profiler over the raw heap `H`.
///
/// Every block handed out carries an [`Envelope`] header, so `free()` finds
/// its bookkeeping in O(1) whatever the mode. The profiler is consumed by
/// [`Profiler::shutdown_report()`].
#[derive(Debug)]
pub struct Profiler<H: RawAllocator = SystemHeap> {
    heap: H,
    config: ProfilerConfig,
    tracking: Tracking,
}

impl<H: RawAllocator> Profiler<H> {
    pub fn new(heap: H, config: ProfilerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(heap, config))
    }

    pub fn with_defaults(heap: H) -> Self {
        Self::build(heap, ProfilerConfig::default())
    }

    fn build(heap: H, config: ProfilerConfig) -> Self {
        let tracking = match config.mode {
            ProfileMode::Off => Tracking::Off,
            ProfileMode::LeakTracking => Tracking::Ledger(Ledger::new(
                Retention::Reclaim {
                    compaction_threshold: config.compaction_threshold,
                },
                config.expansion_ratio,
            )),
            ProfileMode::TrackAll => {
                Tracking::Ledger(Ledger::new(Retention::History, config.expansion_ratio))
            }
            ProfileMode::Detailed => Tracking::Detailed {
                table: BucketTable::new(),
                counters: Counters::default(),
            },
        };
        trace!(target: TARGET, "profiler started in {} mode", config.mode);
        Self {
            heap,
            config,
            tracking,
        }
    }

    /// Allocate `size` bytes charged to `tag`. The returned pointer is aligned
    /// to [`BLOCK_ALIGN`](super::envelope::BLOCK_ALIGN).
    pub fn malloc(&mut self, size: usize, tag: &str) -> Result<NonNull<u8>, AllocFailure> {
        let size = checked_request(size, tag).map_err(log_alloc_failure)?;
        let envelope = allocate_envelope(&self.heap, size, tag).map_err(log_alloc_failure)?;
        let payload = envelope.payload();

        let binding = match &mut self.tracking {
            Tracking::Off => Some(Binding::Untracked),
            Tracking::Ledger(ledger) => ledger.acquire(tag, payload, size).map(Binding::Slot),
            Tracking::Detailed { table, counters } => table.charge(tag, size).map(|index| {
                counters.record_malloc(size);
                Binding::Bucket(index)
            }),
        };
        let Some(binding) = binding else {
            // SAFETY: allocated just above, and never handed out
            unsafe { release(&self.heap, envelope) };
            return Err(log_alloc_failure(AllocFailure::TableFull {
                tag: tag.to_owned(),
            }));
        };
        trace!(target: TARGET, "malloc({size}, {tag}) -> {payload:?} ({binding})");
        Ok(envelope.seal(binding))
    }

    /// Free a pointer returned by [`Profiler::malloc()`]. Null is a no-op.
    ///
    /// A pointer that cannot be matched to a live allocation is rejected
    /// without freeing anything or touching the bookkeeping.
    ///
    /// # Safety
    ///
    /// - The 16 bytes in front of `ptr` must be readable. This holds for any
    ///   pointer this profiler handed out, as long as the raw heap has not
    ///   unmapped the block; a second free of the same pointer is only
    ///   caught if it has not.
    pub unsafe fn free(&mut self, ptr: *mut u8, tag: &str) -> Result<(), FreeFailure> {
        let Some(payload) = NonNull::new(ptr) else {
            return Ok(());
        };
        let mode = self.config.mode;
        // SAFETY: passed to caller
        let result = unsafe { open_checked(payload, tag) }.and_then(|(envelope, binding, layout)| {
            match (binding, &mut self.tracking) {
                (Binding::Untracked, _) => {}
                (Binding::Slot(index), Tracking::Ledger(ledger)) => {
                    match ledger.lookup(index, payload) {
                        Ok(record) if record.size() == envelope.size() => {}
                        Ok(_) | Err(LookupError::Mismatch { .. }) => {
                            return Err(FreeFailure::SlotMismatch {
                                index,
                                tag: tag.to_owned(),
                            })
                        }
                        Err(LookupError::OutOfRange { index, len }) => {
                            return Err(FreeFailure::SlotOutOfRange {
                                index,
                                len,
                                tag: tag.to_owned(),
                            })
                        }
                        Err(LookupError::NotLive { .. }) => {
                            return Err(FreeFailure::AlreadyFreed {
                                tag: tag.to_owned(),
                            })
                        }
                    }
                    ledger.vacate(index as usize);
                }
                (Binding::Bucket(index), Tracking::Detailed { table, counters }) => {
                    if let Err(corruption) = table.release(index, envelope.size()) {
                        // `&mut self` keeps the dump from re-entering; behind a
                        // `ProfilerCell` its guard routes any nested call to the
                        // raw heap until the dump is done
                        dump_buckets(table);
                        return Err(FreeFailure::CorruptedBundle {
                            detail: corruption.to_string(),
                            tag: tag.to_owned(),
                        });
                    }
                    counters.record_free(envelope.size());
                }
                (binding, _) => {
                    return Err(FreeFailure::ModeMismatch {
                        binding,
                        mode,
                        tag: tag.to_owned(),
                    })
                }
            }
            trace!(target: TARGET, "free({payload:?}, {tag}) ({binding})");
            envelope.retire();
            // SAFETY: the header matched a live allocation, so the block came
            // from this heap with this layout
            unsafe { self.heap.deallocate(envelope.block(), layout) };
            Ok(())
        });
        result.map_err(log_free_failure)?;

        if let Tracking::Ledger(ledger) = &mut self.tracking {
            if ledger.needs_compaction() {
                ledger.compact(|pointer, slot| {
                    // SAFETY: `pointer` belongs to a live record, so its block is
                    // still allocated and its header is ours
                    if let Ok((envelope, _)) = unsafe { Envelope::open(pointer) } {
                        envelope.rebind(Binding::Slot(slot));
                    }
                });
            }
        }
        Ok(())
    }

    pub fn mode(&self) -> ProfileMode {
        self.config.mode
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn heap(&self) -> &H {
        &self.heap
    }

    /// Running totals. All zero in [`ProfileMode::Off`].
    pub fn counters(&self) -> Counters {
        match &self.tracking {
            Tracking::Off => Counters::default(),
            Tracking::Ledger(ledger) => *ledger.counters(),
            Tracking::Detailed { counters, .. } => *counters,
        }
    }

    pub fn ledger(&self) -> Option<&Ledger> {
        match &self.tracking {
            Tracking::Ledger(ledger) => Some(ledger),
            _ => None,
        }
    }

    pub fn ledger_stats(&self) -> Option<LedgerStats> {
        self.ledger().map(Ledger::stats)
    }

    pub fn buckets(&self) -> Option<&BucketTable> {
        match &self.tracking {
            Tracking::Detailed { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Stop profiling, log the aggregated report, and return it. Blocks still
    /// allocated stay allocated.
    pub fn shutdown_report(self) -> ProfileReport {
        let report = match self.tracking {
            Tracking::Off => ProfileReport::off(),
            Tracking::Ledger(ledger) => ProfileReport::from_ledger(self.config.mode, &ledger),
            Tracking::Detailed { table, counters } => {
                ProfileReport::from_detailed(table.into_buckets(), counters)
            }
        };
        report.log();
        report
    }
}

fn checked_request(size: usize, tag: &str) -> Result<u32, AllocFailure> {
    if tag.is_empty() {
        return Err(AllocFailure::EmptyTag);
    }
    u32::try_from(size).map_err(|_| AllocFailure::TooLarge {
        size,
        tag: tag.to_owned(),
    })
}

/// Get a block big enough for a `size` byte payload plus its header
pub(super) fn allocate_envelope<H>(heap: &H, size: u32, tag: &str) -> Result<Envelope, AllocFailure>
where
    H: RawAllocator + ?Sized,
{
    match Envelope::layout(size).and_then(|layout| heap.allocate(layout)) {
        // SAFETY: allocated with `Envelope::layout(size)`
        Some(block) => Ok(unsafe { Envelope::wrap(block, size) }),
        None => cold(|| {
            Err(AllocFailure::OutOfMemory {
                size: size as usize,
                tag: tag.to_owned(),
            })
        }),
    }
}

/// Pass a `size` byte allocation straight through to `heap`, with an
/// untracked header so that any `free()` can take it back
pub(crate) fn allocate_untracked<H>(heap: &H, size: usize, tag: &str) -> Result<NonNull<u8>, AllocFailure>
where
    H: RawAllocator + ?Sized,
{
    let size = checked_request(size, tag).map_err(log_alloc_failure)?;
    let envelope = allocate_envelope(heap, size, tag).map_err(log_alloc_failure)?;
    Ok(envelope.seal(Binding::Untracked))
}

/// Read the header in front of `payload`, mapping a bad header to the failure
/// `free()` reports for it
///
/// # Safety
///
/// See [`Envelope::open()`]
pub(crate) unsafe fn open_checked(
    payload: NonNull<u8>,
    tag: &str,
) -> Result<(Envelope, Binding, Layout), FreeFailure> {
    // SAFETY: passed to caller
    match unsafe { Envelope::open(payload) } {
        Ok((envelope, binding)) => match envelope.block_layout() {
            Some(layout) => Ok((envelope, binding, layout)),
            None => Err(FreeFailure::Unknown {
                tag: tag.to_owned(),
            }),
        },
        Err(HeaderError::Foreign) => Err(FreeFailure::Unknown {
            tag: tag.to_owned(),
        }),
        Err(HeaderError::Freed) => Err(FreeFailure::AlreadyFreed {
            tag: tag.to_owned(),
        }),
    }
}

/// Tombstone the header and hand the block back
///
/// # Safety
///
/// `envelope` must wrap a live block from `heap`
pub(crate) unsafe fn release<H>(heap: &H, envelope: Envelope)
where
    H: RawAllocator + ?Sized,
{
    let Some(layout) = envelope.block_layout() else {
        return;
    };
    envelope.retire();
    // SAFETY: passed to caller
    unsafe { heap.deallocate(envelope.block(), layout) };
}

pub(super) fn log_alloc_failure(failure: AllocFailure) -> AllocFailure {
    cold(|| {
        error!(target: TARGET, "malloc failed: {failure}");
        failure
    })
}

pub(crate) fn log_free_failure(failure: FreeFailure) -> FreeFailure {
    cold(|| {
        error!(target: TARGET, "free failed: {failure}");
        failure
    })
}

fn dump_buckets(table: &BucketTable) {
    cold(|| {
        error!(
            target: "tagalloc::detailed",
            "corrupted bucket header, dumping {} buckets",
            table.buckets().len()
        );
        for (index, bucket) in table.buckets().iter().enumerate() {
            error!(
                target: "tagalloc::detailed",
                "  [{index}] {}: count={}, total={}, peak={}",
                bucket.tag,
                bucket.count,
                bucket.total_size,
                bucket.peak_size
            );
        }
    })
}
