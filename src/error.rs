use thiserror::Error;

use crate::alloc::envelope::Binding;
use crate::config::ProfileMode;

/// Why `malloc()` returned no block
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocFailure {
    #[error("allocation tag must not be empty")]
    EmptyTag,

    #[error("cannot profile a {size} byte allocation, sizes are limited to u32::MAX (tag: {tag})")]
    TooLarge { size: usize, tag: String },

    #[error("raw heap could not provide {size} bytes (tag: {tag})")]
    OutOfMemory { size: usize, tag: String },

    #[error("bookkeeping table is full (tag: {tag})")]
    TableFull { tag: String },
}

/// Why `free()` refused a pointer. The block is never released in any of
/// these cases.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FreeFailure {
    #[error("attempted freeing an unallocated block (tag: {tag})")]
    Unknown { tag: String },

    #[error("attempted freeing an already freed block (tag: {tag})")]
    AlreadyFreed { tag: String },

    #[error("header names slot {index} but the ledger has {len} slots (tag: {tag})")]
    SlotOutOfRange { index: u32, len: usize, tag: String },

    #[error("slot {index} belongs to another block (tag: {tag})")]
    SlotMismatch { index: u32, tag: String },

    #[error("corrupted bundled data: {detail} (tag: {tag})")]
    CorruptedBundle { detail: String, tag: String },

    #[error("block is bound to {binding}, which {mode} mode does not track (tag: {tag})")]
    ModeMismatch {
        binding: Binding,
        mode: ProfileMode,
        tag: String,
    },
}

/// Invalid profiler configuration
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown profiling mode '{0}', expected one of off, leak, all, detailed (or 0-3)")]
    UnknownMode(String),

    #[error("compaction threshold must be a positive integer, got '{0}'")]
    InvalidCompactionThreshold(String),

    #[error("expansion ratio must lie strictly between 0 and 1, got '{0}'")]
    InvalidExpansionRatio(String),
}
