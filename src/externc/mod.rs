//! C entry points. Each thread gets its own profiler over the C library heap.
//!
//! Until `tagalloc_initialize()` is called, and again after
//! `tagalloc_report()`, allocations pass straight through untracked, so
//! `tagalloc_malloc()`/`tagalloc_free()` are always safe to call.

use std::{
    borrow::Cow,
    ffi::{c_char, c_int, CStr},
    ptr::{self, NonNull},
};

use libc::{c_void, size_t};
use log::error;

use crate::{
    alloc::{profiler, LibcHeap, ProfilerCell},
    config::{ProfileMode, ProfilerConfig},
    report::ProfileReport,
};

thread_local! {
    static PROFILER: ProfilerCell<LibcHeap> = ProfilerCell::new(LibcHeap);
}

const UNTAGGED: &str = "untagged";

/// # Safety
///
/// `tag` must be null or a valid nul-terminated string
unsafe fn tag_str<'a>(tag: *const c_char) -> Cow<'a, str> {
    if tag.is_null() {
        return Cow::Borrowed(UNTAGGED);
    }
    // SAFETY: passed to caller
    match unsafe { CStr::from_ptr(tag) }.to_string_lossy() {
        tag if tag.is_empty() => Cow::Borrowed(UNTAGGED),
        tag => tag,
    }
}

/// Start profiling on this thread. `mode` is 0 (off), 1 (leak tracking), 2
/// (track all) or 3 (detailed); a negative `mode` reads `TAGALLOC_MODE`.
/// Compaction threshold and expansion ratio always come from the environment.
///
/// Returns 0 on success, 1 if already initialized, -1 on a bad mode.
#[no_mangle]
pub extern "C" fn tagalloc_initialize(mode: c_int) -> c_int {
    let mut config = ProfilerConfig::from_env();
    if mode >= 0 {
        let Some(mode) = ProfileMode::from_code(mode.into()) else {
            error!(target: "tagalloc::profiler", "unknown profiling mode {mode}");
            return -1;
        };
        config.mode = mode;
    }
    PROFILER
        .try_with(|cell| match cell.initialize(config) {
            Ok(true) => 0,
            Ok(false) => 1,
            Err(err) => {
                error!(target: "tagalloc::profiler", "{err}");
                -1
            }
        })
        .unwrap_or(-1)
}

/// Returns null if the allocation fails
///
/// # Safety
///
/// `tag` must be null or a valid nul-terminated string
#[no_mangle]
pub unsafe extern "C" fn tagalloc_malloc(size: size_t, tag: *const c_char) -> *mut c_void {
    // SAFETY: passed to caller
    let tag = unsafe { tag_str(tag) };
    let block = PROFILER
        .try_with(|cell| cell.malloc(size, &tag))
        // thread is shutting down, the profiler is gone
        .unwrap_or_else(|_| profiler::allocate_untracked(&LibcHeap, size, &tag));
    block.map_or(ptr::null_mut(), |ptr| ptr.as_ptr().cast())
}

/// Returns 0 if the block was freed (or `ptr` is null), -1 if it was
/// rejected. A rejected block is left allocated.
///
/// # Safety
///
/// - `ptr` must be null or come from `tagalloc_malloc()` on this thread
/// - `tag` must be null or a valid nul-terminated string
#[no_mangle]
pub unsafe extern "C" fn tagalloc_free(ptr: *mut c_void, tag: *const c_char) -> c_int {
    // SAFETY: passed to caller
    let tag = unsafe { tag_str(tag) };
    let result = PROFILER
        // SAFETY: passed to caller
        .try_with(|cell| unsafe { cell.free(ptr.cast(), &tag) })
        .unwrap_or_else(|_| {
            let Some(payload) = NonNull::new(ptr.cast()) else {
                return Ok(());
            };
            // SAFETY: passed to caller
            unsafe { profiler::open_checked(payload, &tag) }.map(|(envelope, _, _)| {
                // SAFETY: header is live and ours
                unsafe { profiler::release(&LibcHeap, envelope) }
            })
        });
    match result {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn take_report() -> Option<ProfileReport> {
    PROFILER.try_with(ProfilerCell::shutdown_report).ok().flatten()
}

/// Stop profiling on this thread, log the report, and return the number of
/// bytes still allocated. Returns 0 if profiling was never started.
#[no_mangle]
pub extern "C" fn tagalloc_report() -> u64 {
    take_report().map_or(0, |report| report.leaked_bytes())
}

/// Like `tagalloc_report()`, but also writes the report as JSON to `path`.
/// Returns -1 if there was no report or the file could not be written.
///
/// # Safety
///
/// `path` must be a valid nul-terminated string
#[no_mangle]
pub unsafe extern "C" fn tagalloc_write_report(path: *const c_char) -> c_int {
    if path.is_null() {
        return -1;
    }
    // SAFETY: passed to caller
    let path = unsafe { CStr::from_ptr(path) }.to_string_lossy().into_owned();
    let Some(report) = take_report() else {
        return -1;
    };
    match report.write_json(&path) {
        Ok(()) => 0,
        Err(err) => {
            error!(target: "tagalloc::report", "could not write {path}: {err}");
            -1
        }
    }
}
