//! Raw heaps that the profiler sits on top of. The profiler never decides
//! where memory comes from, it only asks one of these for blocks and gives
//! them back.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::RefCell,
    ptr::NonNull,
    rc::Rc,
};

use crate::util::hint::cold;

pub(crate) mod c {
    use libc::{c_void, size_t};

    extern "C" {
        pub fn aligned_alloc(align: size_t, size: size_t) -> *mut c_void;
        pub fn free(ptr: *mut c_void);
    }
}

/// The raw heap interface: `rawAlloc()` and `rawFree()`, with the `Layout`
/// carried along since some heaps (dlmalloc) need the size back on free.
///
/// # Safety
///
/// - `allocate()` must return blocks valid for reads and writes of
///   `layout.size()` bytes, aligned to `layout.align()`
/// - A block must stay valid until it is passed to `deallocate()`
pub unsafe trait RawAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate()` on this heap, with the same `layout`,
    /// and must not have been deallocated already.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

// SAFETY: forwards to `A`
unsafe impl<A> RawAllocator for &A
where
    A: RawAllocator + ?Sized,
{
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

// SAFETY: forwards to `A`
unsafe impl<A> RawAllocator for Rc<A>
where
    A: RawAllocator + ?Sized,
{
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

/// Rust's `System` allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHeap;

// SAFETY: `System` upholds the `GlobalAlloc` contract, which is stricter
unsafe impl RawAllocator for SystemHeap {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return cold(|| None);
        }
        // SAFETY: non-zero size checked above
        NonNull::new(unsafe { System.alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { System.dealloc(ptr.as_ptr(), layout) }
    }
}

/// The C library's `malloc()` family, this is what the C ABI uses
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHeap;

// SAFETY: `aligned_alloc()` returns blocks of at least `size` bytes aligned to
// `align`, or null
unsafe impl RawAllocator for LibcHeap {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        // `aligned_alloc()` wants the size to be a multiple of the alignment
        let size = layout.pad_to_align().size();
        // SAFETY: `align` is a power of two and `size` is a multiple of it
        let data = unsafe { c::aligned_alloc(layout.align(), size) };
        if data.is_null() {
            return cold(|| None);
        }
        NonNull::new(data.cast())
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _: Layout) {
        unsafe { c::free(ptr.as_ptr().cast()) }
    }
}

/// A private `dlmalloc()` heap. Each `DlHeap` owns its own arena, so blocks
/// must be freed on the heap that produced them.
pub struct DlHeap {
    inner: RefCell<dlmalloc::Dlmalloc>,
}

impl DlHeap {
    pub const fn new() -> Self {
        Self {
            inner: RefCell::new(dlmalloc::Dlmalloc::new()),
        }
    }
}

impl Default for DlHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DlHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DlHeap")
    }
}

// SAFETY: `Dlmalloc::malloc()` returns blocks satisfying the size and
// alignment it was asked for, or null
unsafe impl RawAllocator for DlHeap {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let mut heap = self.inner.try_borrow_mut().ok()?;
        // SAFETY: the arena is only ever touched through this `RefCell`
        let data = unsafe { heap.malloc(layout.size(), layout.align()) };
        if data.is_null() {
            return cold(|| None);
        }
        NonNull::new(data)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let mut heap = self.inner.borrow_mut();
        // SAFETY: caller guarantees `ptr` came from this arena with `layout`
        unsafe { heap.free(ptr.as_ptr(), layout.size(), layout.align()) }
    }
}
