//! The shutdown report: allocations grouped by tag.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

use ahash::RandomState;
use hashbrown::HashMap;
use log::{info, warn};
use serde::Serialize;

use crate::{
    alloc::{
        buckets::DetailedBucket,
        counters::Counters,
        ledger::{AllocationRecord, Ledger, LedgerStats, Retention},
    },
    config::ProfileMode,
};

const TARGET: &str = "tagalloc::report";

/// Everything allocated under one tag
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AggregationBucket {
    pub tag: String,
    pub count: u64,
    pub total_size: u64,
    /// Only tracked in detailed mode
    pub peak_size: Option<u64>,
}

impl AggregationBucket {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_owned(),
            count: 0,
            total_size: 0,
            peak_size: None,
        }
    }

    fn is_leak(&self) -> bool {
        self.count > 0 || self.total_size > 0
    }
}

impl From<DetailedBucket> for AggregationBucket {
    fn from(bucket: DetailedBucket) -> Self {
        Self {
            tag: bucket.tag.into(),
            count: bucket.count,
            total_size: bucket.total_size,
            peak_size: Some(bucket.peak_size),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProfileReport {
    pub mode: ProfileMode,
    /// In the order each tag was first seen
    pub buckets: Vec<AggregationBucket>,
    pub counters: Counters,
    pub calls_mismatched: bool,
    /// `None` for modes without a ledger
    pub ledger: Option<LedgerStats>,
}

impl ProfileReport {
    pub(crate) fn off() -> Self {
        Self {
            mode: ProfileMode::Off,
            buckets: Vec::new(),
            counters: Counters::default(),
            calls_mismatched: false,
            ledger: None,
        }
    }

    /// Leak-tracking reports what is still live; track-all reports every
    /// allocation the ledger kept, freed or not
    pub(crate) fn from_ledger(mode: ProfileMode, ledger: &Ledger) -> Self {
        let buckets = match ledger.retention() {
            Retention::Reclaim { .. } => group_by_tag(ledger.live_records()),
            Retention::History => {
                group_by_tag(ledger.records().iter().filter(|record| !record.is_vacated()))
            }
        };
        let counters = *ledger.counters();
        Self {
            mode,
            buckets,
            counters,
            calls_mismatched: counters.calls_mismatched(),
            ledger: Some(ledger.stats()),
        }
    }

    pub(crate) fn from_detailed(buckets: Vec<DetailedBucket>, counters: Counters) -> Self {
        Self {
            mode: ProfileMode::Detailed,
            buckets: buckets.into_iter().map(AggregationBucket::from).collect(),
            counters,
            calls_mismatched: counters.calls_mismatched(),
            ledger: None,
        }
    }

    pub fn bucket(&self, tag: &str) -> Option<&AggregationBucket> {
        self.buckets.iter().find(|bucket| bucket.tag == tag)
    }

    /// Bytes that were never freed
    pub fn leaked_bytes(&self) -> u64 {
        self.counters.live_bytes
    }

    pub fn has_leaks(&self) -> bool {
        self.counters.live_blocks > 0 || self.counters.live_bytes > 0
    }

    pub fn log(&self) {
        let counters = &self.counters;
        info!(
            target: TARGET,
            "{} profile: {} mallocs, {} frees",
            self.mode,
            counters.malloc_calls,
            counters.free_calls
        );
        if self.calls_mismatched {
            warn!(
                target: TARGET,
                "malloc/free calls mismatched: {} mallocs vs {} frees",
                counters.malloc_calls,
                counters.free_calls
            );
        }
        for bucket in &self.buckets {
            match bucket.peak_size {
                Some(peak) => info!(
                    target: TARGET,
                    "{}: count={}, total={} bytes, peak={} bytes",
                    bucket.tag,
                    bucket.count,
                    bucket.total_size,
                    peak
                ),
                None => info!(
                    target: TARGET,
                    "{}: count={}, total={} bytes",
                    bucket.tag,
                    bucket.count,
                    bucket.total_size
                ),
            }
            if self.mode == ProfileMode::Detailed && bucket.is_leak() {
                warn!(
                    target: "tagalloc::detailed",
                    "LEAK DETECTED: {} still holds {} bytes in {} blocks",
                    bucket.tag,
                    bucket.total_size,
                    bucket.count
                );
            }
        }
        info!(
            target: TARGET,
            "total unfreed: {} bytes in {} blocks",
            counters.live_bytes,
            counters.live_blocks
        );
        info!(target: TARGET, "peak usage: {} bytes", counters.peak_bytes);
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json<P>(&self, path: P) -> io::Result<()>
    where
        P: AsRef<Path>,
    {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()
    }
}

/// Group records by tag, keeping the order in which tags first appear
fn group_by_tag<'a, I>(records: I) -> Vec<AggregationBucket>
where
    I: IntoIterator<Item = &'a AllocationRecord>,
{
    let mut buckets: Vec<AggregationBucket> = Vec::new();
    let mut by_tag: HashMap<&str, usize, RandomState> = HashMap::default();
    for record in records {
        let index = *by_tag.entry(record.tag()).or_insert_with(|| {
            buckets.push(AggregationBucket::new(record.tag()));
            buckets.len() - 1
        });
        let bucket = &mut buckets[index];
        bucket.count += 1;
        bucket.total_size += u64::from(record.size());
    }
    buckets
}
