//! Leak a few tagged blocks and dump the report as JSON.
//!
//! Usage: `cargo run --example leak_report -- [path]` (default `report.json`)

use tagalloc::{ProfileMode, ProfilerCell, ProfilerConfig, SystemHeap};

fn main() {
    tagalloc::logging::init();
    let path = std::env::args().nth(1).unwrap_or_else(|| "report.json".to_owned());
    let mut config = ProfilerConfig::from_env();
    if config.mode == ProfileMode::Off {
        config.mode = ProfileMode::Detailed;
    }
    let cell = ProfilerCell::with_config(SystemHeap, config).expect("config from env is validated");

    let mut kept = Vec::new();
    for (n, tag) in ["parser", "parser", "cache", "scratch"].iter().enumerate() {
        kept.push((cell.malloc(100 * (n + 1), tag).expect("out of memory"), *tag));
    }
    let (scratch, tag) = kept.pop().expect("allocated above");
    unsafe { cell.free(scratch.as_ptr(), tag) }.expect("block came from this profiler");

    let report = cell.shutdown_report().expect("profiler was initialized");
    report.write_json(&path).expect("could not write report");
    println!("{} leaked bytes, report written to {path}", report.leaked_bytes());
}
