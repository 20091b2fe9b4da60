//! Detailed mode keeps no per-allocation records at all. Each tag gets one
//! bucket, and the envelope header remembers which bucket and how many bytes,
//! so that `free()` can take them back out again.
//!
//! In this mode nothing ties a header to an allocation except the header
//! itself, so a corrupted header can only be caught by sanity checks against
//! the bucket it names.

use std::fmt;

use ahash::RandomState;
use hashbrown::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetailedBucket {
    pub tag: Box<str>,
    /// Allocations with this tag that are currently live
    pub count: u64,
    /// Bytes currently live under this tag
    pub total_size: u64,
    /// High-water mark of `total_size`
    pub peak_size: u64,
}

/// What was wrong with a header in detailed mode
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BucketCorruption {
    UnknownBucket { index: u32, buckets: usize },
    Empty { index: u32 },
    SizeExceedsTotal { index: u32, size: u32, total_size: u64 },
    PeakBelowTotal { index: u32, total_size: u64, peak_size: u64 },
}

impl fmt::Display for BucketCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownBucket { index, buckets } => {
                write!(f, "bucket {index} does not exist ({buckets} buckets)")
            }
            Self::Empty { index } => write!(f, "bucket {index} has no live allocations"),
            Self::SizeExceedsTotal {
                index,
                size,
                total_size,
            } => write!(
                f,
                "bucket {index} holds {total_size} bytes, cannot release {size}"
            ),
            Self::PeakBelowTotal {
                index,
                total_size,
                peak_size,
            } => write!(
                f,
                "bucket {index} peak {peak_size} is below its total {total_size}"
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct BucketTable {
    buckets: Vec<DetailedBucket>,
    by_tag: HashMap<Box<str>, u32, RandomState>,
}

impl BucketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge a `size` byte allocation to `tag`, creating the bucket on first
    /// use. Returns `None` if there are more distinct tags than a header can
    /// address.
    pub fn charge(&mut self, tag: &str, size: u32) -> Option<u32> {
        let index = match self.by_tag.get(tag).copied() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.buckets.len()).ok()?;
                self.buckets.push(DetailedBucket {
                    tag: tag.into(),
                    count: 0,
                    total_size: 0,
                    peak_size: 0,
                });
                self.by_tag.insert(tag.into(), index);
                index
            }
        };
        let bucket = &mut self.buckets[index as usize];
        bucket.count += 1;
        bucket.total_size += u64::from(size);
        bucket.peak_size = bucket.peak_size.max(bucket.total_size);
        Some(index)
    }

    /// Sanity check a header before trusting it
    pub fn validate(&self, index: u32, size: u32) -> Result<&DetailedBucket, BucketCorruption> {
        let bucket = self
            .buckets
            .get(index as usize)
            .ok_or(BucketCorruption::UnknownBucket {
                index,
                buckets: self.buckets.len(),
            })?;
        if bucket.count == 0 {
            return Err(BucketCorruption::Empty { index });
        }
        if bucket.total_size < u64::from(size) {
            return Err(BucketCorruption::SizeExceedsTotal {
                index,
                size,
                total_size: bucket.total_size,
            });
        }
        if bucket.peak_size < bucket.total_size {
            return Err(BucketCorruption::PeakBelowTotal {
                index,
                total_size: bucket.total_size,
                peak_size: bucket.peak_size,
            });
        }
        Ok(bucket)
    }

    pub fn release(&mut self, index: u32, size: u32) -> Result<(), BucketCorruption> {
        self.validate(index, size)?;
        let bucket = &mut self.buckets[index as usize];
        bucket.count -= 1;
        bucket.total_size -= u64::from(size);
        Ok(())
    }

    pub fn get(&self, index: u32) -> Option<&DetailedBucket> {
        self.buckets.get(index as usize)
    }

    /// Buckets in the order their tags were first seen
    pub fn buckets(&self) -> &[DetailedBucket] {
        &self.buckets
    }

    pub fn into_buckets(self) -> Vec<DetailedBucket> {
        self.buckets
    }
}
