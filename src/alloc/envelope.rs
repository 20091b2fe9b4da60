//! The allocation envelope: a small header that lives right in front of the
//! bytes we hand out, so that `free()` can find its bookkeeping without
//! searching for it.
//!
//! ```plaintext
//! +--------------------+ <- block (what the raw heap gave us)
//! | EnvelopeHeader     | HEADER_SIZE bytes
//! | padding...         |
//! +--------------------+ <- payload (what the caller gets)
//! | actual requested   | header.size bytes
//! | size               |
//! +--------------------+
//! ```
//!
//! All of the pointer arithmetic for this lives in [`Envelope::payload()`] and
//! [`Envelope::open()`]. Nothing else in the crate offsets a pointer.

use std::{alloc::Layout, fmt, mem, ptr::NonNull, slice};

use bytemuck::{Pod, Zeroable};

use crate::util::{assert::aligned_to, num::round_up};

/// Every block we hand out is aligned to this
pub const BLOCK_ALIGN: usize = 16;

/// Distance between the start of a block and the payload
pub const HEADER_SIZE: usize = round_up(mem::size_of::<EnvelopeHeader>(), BLOCK_ALIGN);

const LIVE_MAGIC: u32 = 0x7a6a_11c0;
const FREED_MAGIC: u32 = 0xdead_f4ee;

const KIND_SLOT: u32 = 1;
const KIND_BUCKET: u32 = 2;
const KIND_UNTRACKED: u32 = 3;

/// What the header of a block points at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    /// Index into the allocation ledger
    Slot(u32),
    /// Index into the detailed-mode bucket table
    Bucket(u32),
    /// Allocated while profiling was bypassed; nothing to look up
    Untracked,
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slot(index) => write!(f, "ledger slot {index}"),
            Self::Bucket(index) => write!(f, "bucket {index}"),
            Self::Untracked => f.write_str("untracked block"),
        }
    }
}

/// The header itself, as it sits in memory
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct EnvelopeHeader {
    magic: u32,
    kind: u32,
    index: u32,
    /// The exact requested size of this allocation
    size: u32,
}

impl EnvelopeHeader {
    fn sealed(binding: Binding, size: u32) -> Self {
        let (kind, index) = match binding {
            Binding::Slot(index) => (KIND_SLOT, index),
            Binding::Bucket(index) => (KIND_BUCKET, index),
            Binding::Untracked => (KIND_UNTRACKED, 0),
        };
        Self {
            magic: LIVE_MAGIC,
            kind,
            index,
            size,
        }
    }

    fn binding(&self) -> Result<Binding, HeaderError> {
        match (self.magic, self.kind) {
            (FREED_MAGIC, _) => Err(HeaderError::Freed),
            (LIVE_MAGIC, KIND_SLOT) => Ok(Binding::Slot(self.index)),
            (LIVE_MAGIC, KIND_BUCKET) => Ok(Binding::Bucket(self.index)),
            (LIVE_MAGIC, KIND_UNTRACKED) => Ok(Binding::Untracked),
            _ => Err(HeaderError::Foreign),
        }
    }
}

/// Why a header could not be trusted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderError {
    /// Null, or not something we ever sealed
    Foreign,
    /// Carries the tombstone left behind by [`Envelope::retire()`]
    Freed,
}

/// A block from the raw heap together with the size the caller asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Envelope {
    block: NonNull<u8>,
    size: u32,
}

impl Envelope {
    /// The layout to request from the raw heap for a `size` byte payload.
    /// `None` only on targets where the header pushes it past `isize::MAX`.
    pub fn layout(size: u32) -> Option<Layout> {
        let total = HEADER_SIZE.checked_add(usize::try_from(size).ok()?)?;
        Layout::from_size_align(total, BLOCK_ALIGN).ok()
    }

    /// Wrap a fresh block from the raw heap
    ///
    /// # Safety
    ///
    /// `block` must have been allocated with `Envelope::layout(size)`
    pub unsafe fn wrap(block: NonNull<u8>, size: u32) -> Self {
        debug_assert!(aligned_to(block, BLOCK_ALIGN));
        Self { block, size }
    }

    /// The pointer the caller sees
    pub fn payload(&self) -> NonNull<u8> {
        // SAFETY: the block is at least `HEADER_SIZE` bytes long, so this is
        // in bounds (or one past the end for a zero-sized payload)
        unsafe { self.block.add(HEADER_SIZE) }
    }

    pub fn block(&self) -> NonNull<u8> {
        self.block
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn block_layout(&self) -> Option<Layout> {
        Self::layout(self.size)
    }

    /// Write the header and return the payload pointer
    pub fn seal(self, binding: Binding) -> NonNull<u8> {
        self.write(EnvelopeHeader::sealed(binding, self.size));
        self.payload()
    }

    /// Point an already sealed block at a different binding. Used when
    /// compaction moves a ledger record.
    pub fn rebind(&self, binding: Binding) {
        self.write(EnvelopeHeader::sealed(binding, self.size));
    }

    /// Leave a tombstone in the header just before the block goes back to the
    /// raw heap, so a second `free()` of the same pointer can be recognised
    /// for as long as the raw heap leaves the bytes alone.
    pub fn retire(self) {
        self.write(EnvelopeHeader {
            magic: FREED_MAGIC,
            ..EnvelopeHeader::zeroed()
        });
    }

    fn write(&self, header: EnvelopeHeader) {
        let bytes = bytemuck::bytes_of(&header);
        // SAFETY: construction guarantees `HEADER_SIZE` writable bytes at
        // `block`, and `HEADER_SIZE >= size_of::<EnvelopeHeader>()`
        unsafe {
            self.block
                .as_ptr()
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
    }

    /// Recover the envelope around a payload pointer and read its header. This
    /// is O(1): it's one subtraction and one 16 byte read.
    ///
    /// # Safety
    ///
    /// - The `HEADER_SIZE` bytes in front of `payload` must be readable. This
    ///   holds for anything returned by [`Envelope::seal()`] whose block is
    ///   still mapped by the raw heap.
    pub unsafe fn open(payload: NonNull<u8>) -> Result<(Self, Binding), HeaderError> {
        let address = payload.as_ptr() as usize;
        if address < HEADER_SIZE || address % BLOCK_ALIGN != 0 {
            return Err(HeaderError::Foreign);
        }
        // SAFETY: caller guarantees the header bytes are readable, and we just
        // checked that this does not wrap
        let block = unsafe { payload.sub(HEADER_SIZE) };
        // SAFETY: see above
        let bytes = unsafe { slice::from_raw_parts(block.as_ptr(), mem::size_of::<EnvelopeHeader>()) };
        let header: EnvelopeHeader = bytemuck::pod_read_unaligned(bytes);
        let binding = header.binding()?;
        Ok((
            Self {
                block,
                size: header.size,
            },
            binding,
        ))
    }
}
