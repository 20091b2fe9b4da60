//! Tagged allocation profiling.
//!
//! A [`Profiler`] sits between application code and a raw heap. Every
//! allocation is charged to a caller-supplied tag, and every block carries a
//! small header so that `free()` finds its bookkeeping in O(1). At shutdown
//! the profiler reports what is still allocated, grouped by tag.
//!
//! ```
//! use tagalloc::{Profiler, SystemHeap};
//!
//! let mut profiler = Profiler::with_defaults(SystemHeap);
//! let mesh = profiler.malloc(64, "mesh").unwrap();
//! let _leaked = profiler.malloc(16, "texture").unwrap();
//! unsafe { profiler.free(mesh.as_ptr(), "mesh") }.unwrap();
//!
//! let report = profiler.shutdown_report();
//! assert_eq!(report.leaked_bytes(), 16);
//! assert_eq!(report.bucket("texture").unwrap().count, 1);
//! ```

pub mod alloc;
pub mod config;
pub mod error;
pub mod externc;
pub mod logging;
pub mod report;
pub mod util;

pub use alloc::{DlHeap, LibcHeap, Profiler, ProfilerCell, RawAllocator, SystemHeap};
pub use config::{ProfileMode, ProfilerConfig};
pub use error::{AllocFailure, ConfigError, FreeFailure};
pub use report::{AggregationBucket, ProfileReport};
