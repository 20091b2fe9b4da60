use std::ptr::NonNull;

/// Test if `ptr` is aligned to a multiple of `align`
pub fn aligned_to<T>(ptr: NonNull<T>, align: usize) -> bool {
    ptr.as_ptr() as *const () as usize % align == 0
}
