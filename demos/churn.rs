//! Allocation churn over a private dlmalloc arena. Try it with
//! `TAGALLOC_COMPACTION_THRESHOLD=16 RUST_LOG=debug`.

use tagalloc::{DlHeap, Profiler, ProfilerConfig};

fn main() {
    tagalloc::logging::init();
    let config = ProfilerConfig::from_env();
    let mut profiler = Profiler::new(DlHeap::new(), config).expect("config from env is validated");

    let mut live = Vec::new();
    for round in 0..10_000usize {
        let tag = ["small", "medium", "large"][round % 3];
        let size = 16 << (round % 3 * 4);
        live.push(profiler.malloc(size, tag).expect("dlmalloc ran out of memory"));
        if live.len() > 64 {
            let ptr = live.swap_remove(round * 7 % live.len());
            unsafe { profiler.free(ptr.as_ptr(), tag) }.expect("block came from this profiler");
        }
    }
    for ptr in live.drain(..32) {
        unsafe { profiler.free(ptr.as_ptr(), "drain") }.expect("block came from this profiler");
    }

    if let Some(stats) = profiler.ledger_stats() {
        println!(
            "ledger: {} slots ({} capacity), {} probes, {} scan steps, {} compactions",
            stats.len, stats.capacity, stats.slots_probed, stats.scan_steps, stats.compactions
        );
    }
    let report = profiler.shutdown_report();
    println!("{} bytes left allocated", report.leaked_bytes());
}
