#![allow(dead_code)]

use std::{
    alloc::Layout,
    cell::{Cell, RefCell},
    collections::HashMap,
    ptr::NonNull,
};

use tagalloc::RawAllocator;

/// A raw heap that never gives memory back to the system until it is dropped.
///
/// Freed blocks stay mapped, so reading a header after a (double) free is
/// well defined, and the heap itself notices frees it did not expect.
#[derive(Debug, Default)]
pub struct ArenaHeap {
    chunks: RefCell<Vec<NonNull<[u128]>>>,
    live: RefCell<HashMap<usize, Layout>>,
    fail_next: Cell<usize>,
    allocations: Cell<u64>,
    deallocations: Cell<u64>,
    bad_frees: Cell<u64>,
}

impl ArenaHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` allocations fail
    pub fn fail_next(&self, n: usize) {
        self.fail_next.set(n);
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.get()
    }

    pub fn deallocations(&self) -> u64 {
        self.deallocations.get()
    }

    /// Deallocations of blocks that were not live
    pub fn bad_frees(&self) -> u64 {
        self.bad_frees.get()
    }

    pub fn live_blocks(&self) -> usize {
        self.live.borrow().len()
    }

    /// A 16-aligned pointer into memory the profiler never saw, with `fill`
    /// where a header would be
    pub fn foreign_payload(&self, fill: u8) -> NonNull<u8> {
        let block = self.chunk(64);
        unsafe {
            block.as_ptr().write_bytes(fill, 64);
            block.add(16)
        }
    }

    fn chunk(&self, size: usize) -> NonNull<u8> {
        let words = size.div_ceil(16).max(1);
        let chunk: Box<[u128]> = vec![0u128; words].into_boxed_slice();
        let chunk = NonNull::from(Box::leak(chunk));
        self.chunks.borrow_mut().push(chunk);
        chunk.cast()
    }
}

unsafe impl RawAllocator for ArenaHeap {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        assert!(layout.align() <= 16, "arena only hands out 16-aligned blocks");
        if self.fail_next.get() > 0 {
            self.fail_next.set(self.fail_next.get() - 1);
            return None;
        }
        let block = self.chunk(layout.size());
        self.live.borrow_mut().insert(block.as_ptr() as usize, layout);
        self.allocations.set(self.allocations.get() + 1);
        Some(block)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        match self.live.borrow_mut().remove(&(ptr.as_ptr() as usize)) {
            Some(allocated) => {
                assert_eq!(allocated, layout, "freed with a different layout");
                self.deallocations.set(self.deallocations.get() + 1);
            }
            None => self.bad_frees.set(self.bad_frees.get() + 1),
        }
    }
}

impl Drop for ArenaHeap {
    fn drop(&mut self) {
        for chunk in self.chunks.get_mut().drain(..) {
            drop(unsafe { Box::from_raw(chunk.as_ptr()) });
        }
    }
}

/// Read the header word at `offset` bytes into the header of `payload`
pub unsafe fn header_word(payload: NonNull<u8>, offset: usize) -> u32 {
    unsafe { payload.as_ptr().sub(16).add(offset).cast::<u32>().read() }
}

pub unsafe fn set_header_word(payload: NonNull<u8>, offset: usize, value: u32) {
    unsafe { payload.as_ptr().sub(16).add(offset).cast::<u32>().write(value) }
}
