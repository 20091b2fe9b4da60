pub mod buckets;
pub mod cell;
pub mod counters;
pub mod envelope;
pub mod heap;
pub mod ledger;
pub mod profiler;
pub mod reuse;

pub use cell::ProfilerCell;
pub use heap::{DlHeap, LibcHeap, RawAllocator, SystemHeap};
pub use profiler::Profiler;
