//! A shared handle to a [`Profiler`], for callers that cannot thread a
//! `&mut Profiler` through (the C ABI, allocator hooks, loggers that
//! allocate).
//!
//! The profiler's own bookkeeping may call back into whatever is allocating:
//! the raw heap, a logger, a panic hook. Those nested calls must not touch the
//! profiler while it is mid-update, so the cell flags itself busy for the
//! duration of each call. A nested `malloc()` is passed straight to the raw
//! heap with an untracked header, and a nested `free()` of a tracked block is
//! queued and replayed on the next top-level call.

use std::{
    cell::{Cell, RefCell},
    mem,
    ptr::NonNull,
    rc::Rc,
};

use log::{debug, warn};

use crate::{
    config::ProfilerConfig,
    error::{AllocFailure, ConfigError, FreeFailure},
    report::ProfileReport,
};

use super::{
    envelope::Binding,
    heap::RawAllocator,
    profiler::{self, Profiler},
};

const TARGET: &str = "tagalloc::profiler";

/// Set while a profiler call is in progress on this handle
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    active: Cell<bool>,
    bypassed: Cell<u64>,
}

impl ReentrancyGuard {
    pub const fn new() -> Self {
        Self {
            active: Cell::new(false),
            bypassed: Cell::new(0),
        }
    }

    /// `None` if a call is already in progress
    pub fn enter(&self) -> Option<GuardToken<'_>> {
        if self.active.replace(true) {
            self.bypassed.set(self.bypassed.get() + 1);
            return None;
        }
        Some(GuardToken { guard: self })
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Calls that arrived while the guard was held
    pub fn bypassed(&self) -> u64 {
        self.bypassed.get()
    }
}

/// Releases the guard on drop
#[derive(Debug)]
pub struct GuardToken<'a> {
    guard: &'a ReentrancyGuard,
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.guard.active.set(false);
    }
}

#[derive(Debug)]
struct DeferredFree {
    payload: NonNull<u8>,
    tag: String,
}

/// A profiler behind `&self`, guarded against re-entry. Not `Sync`: keep one
/// per thread.
#[derive(Debug)]
pub struct ProfilerCell<H: RawAllocator> {
    heap: Rc<H>,
    profiler: RefCell<Option<Profiler<Rc<H>>>>,
    guard: ReentrancyGuard,
    deferred: RefCell<Vec<DeferredFree>>,
}

impl<H: RawAllocator> ProfilerCell<H> {
    /// A cell with no profiler yet: everything passes through untracked until
    /// [`ProfilerCell::initialize()`]
    pub fn new(heap: H) -> Self {
        Self {
            heap: Rc::new(heap),
            profiler: RefCell::new(None),
            guard: ReentrancyGuard::new(),
            deferred: RefCell::new(Vec::new()),
        }
    }

    pub fn with_config(heap: H, config: ProfilerConfig) -> Result<Self, ConfigError> {
        let cell = Self::new(heap);
        cell.initialize(config)?;
        Ok(cell)
    }

    /// Start profiling. Returns `Ok(false)` if a profiler is already running,
    /// in which case it is left alone.
    pub fn initialize(&self, config: ProfilerConfig) -> Result<bool, ConfigError> {
        let profiler = Profiler::new(Rc::clone(&self.heap), config)?;
        let Some(_token) = self.guard.enter() else {
            return Ok(false);
        };
        let Ok(mut slot) = self.profiler.try_borrow_mut() else {
            return Ok(false);
        };
        if slot.is_some() {
            warn!(target: TARGET, "profiler already initialized, ignoring");
            return Ok(false);
        }
        *slot = Some(profiler);
        Ok(true)
    }

    pub fn is_active(&self) -> bool {
        self.profiler.try_borrow().map_or(true, |slot| slot.is_some())
    }

    pub fn guard(&self) -> &ReentrancyGuard {
        &self.guard
    }

    /// Frees queued by nested calls and not yet replayed
    pub fn deferred_frees(&self) -> usize {
        self.deferred.try_borrow().map_or(0, |deferred| deferred.len())
    }

    /// Run `f` on the profiler, if there is one and it is not busy
    pub fn inspect<R>(&self, f: impl FnOnce(&Profiler<Rc<H>>) -> R) -> Option<R> {
        let _token = self.guard.enter()?;
        let slot = self.profiler.try_borrow().ok()?;
        slot.as_ref().map(f)
    }

    pub fn malloc(&self, size: usize, tag: &str) -> Result<NonNull<u8>, AllocFailure> {
        let Some(_token) = self.guard.enter() else {
            return profiler::allocate_untracked(&*self.heap, size, tag);
        };
        self.replay_deferred();
        match self.profiler.try_borrow_mut() {
            Ok(mut slot) => match slot.as_mut() {
                Some(profiler) => profiler.malloc(size, tag),
                None => profiler::allocate_untracked(&*self.heap, size, tag),
            },
            Err(_) => profiler::allocate_untracked(&*self.heap, size, tag),
        }
    }

    /// Free a pointer from [`ProfilerCell::malloc()`]. Null is a no-op. A
    /// nested free of a tracked block is queued and always returns `Ok`.
    ///
    /// # Safety
    ///
    /// Same as [`Profiler::free()`]
    pub unsafe fn free(&self, ptr: *mut u8, tag: &str) -> Result<(), FreeFailure> {
        let Some(payload) = NonNull::new(ptr) else {
            return Ok(());
        };
        let Some(_token) = self.guard.enter() else {
            // SAFETY: passed to caller
            return unsafe { self.free_nested(payload, tag) };
        };
        self.replay_deferred();
        let Ok(mut slot) = self.profiler.try_borrow_mut() else {
            // SAFETY: passed to caller
            return unsafe { self.free_nested(payload, tag) };
        };
        match slot.as_mut() {
            // SAFETY: passed to caller
            Some(profiler) => unsafe { profiler.free(payload.as_ptr(), tag) },
            // SAFETY: passed to caller
            None => unsafe { self.free_unprofiled(payload, tag) },
        }
    }

    /// Stop profiling and return the report. `None` if there is no profiler,
    /// or if called from inside another profiler call.
    pub fn shutdown_report(&self) -> Option<ProfileReport> {
        let _token = self.guard.enter()?;
        self.replay_deferred();
        let profiler = self.profiler.try_borrow_mut().ok()?.take()?;
        Some(profiler.shutdown_report())
    }

    /// Only called with the guard held
    fn replay_deferred(&self) {
        let pending = match self.deferred.try_borrow_mut() {
            Ok(mut deferred) if !deferred.is_empty() => mem::take(&mut *deferred),
            _ => return,
        };
        debug!(target: TARGET, "replaying {} deferred frees", pending.len());
        let Ok(mut slot) = self.profiler.try_borrow_mut() else {
            return;
        };
        for DeferredFree { payload, tag } in pending {
            // SAFETY: the payload was checked to carry a live tracked header
            // when it was queued, and the caller of that `free()` promised it
            // stays readable
            let _ = match slot.as_mut() {
                Some(profiler) => unsafe { profiler.free(payload.as_ptr(), &tag) },
                None => unsafe { self.free_unprofiled(payload, &tag) },
            };
        }
    }

    /// # Safety
    ///
    /// Same as [`Profiler::free()`]
    unsafe fn free_nested(&self, payload: NonNull<u8>, tag: &str) -> Result<(), FreeFailure> {
        // SAFETY: passed to caller
        let (envelope, binding, _) =
            unsafe { profiler::open_checked(payload, tag) }.map_err(profiler::log_free_failure)?;
        if binding == Binding::Untracked {
            // SAFETY: a live untracked header means the block came from our
            // heap and has not been freed
            unsafe { profiler::release(&*self.heap, envelope) };
            return Ok(());
        }
        match self.deferred.try_borrow_mut() {
            Ok(mut deferred) => {
                deferred.push(DeferredFree {
                    payload,
                    tag: tag.to_owned(),
                });
                Ok(())
            }
            Err(_) => Err(profiler::log_free_failure(FreeFailure::Unknown {
                tag: tag.to_owned(),
            })),
        }
    }

    /// No profiler to check against, so any live header is trusted
    ///
    /// # Safety
    ///
    /// Same as [`Profiler::free()`]
    unsafe fn free_unprofiled(&self, payload: NonNull<u8>, tag: &str) -> Result<(), FreeFailure> {
        // SAFETY: passed to caller
        let (envelope, binding, _) =
            unsafe { profiler::open_checked(payload, tag) }.map_err(profiler::log_free_failure)?;
        if binding != Binding::Untracked {
            debug!(target: TARGET, "freeing {binding} after shutdown (tag: {tag})");
        }
        // SAFETY: the header is live and ours
        unsafe { profiler::release(&*self.heap, envelope) };
        Ok(())
    }
}
