mod common;

use common::{header_word, set_header_word, ArenaHeap};
use tagalloc::{
    alloc::counters::Counters, AllocFailure, FreeFailure, ProfileMode, Profiler, ProfilerConfig,
};

fn profiler(heap: &ArenaHeap, mode: ProfileMode) -> Profiler<&ArenaHeap> {
    tagalloc::logging::init_for_tests();
    Profiler::new(heap, ProfilerConfig::with_mode(mode)).unwrap()
}

#[test]
fn leak_tracking_reports_outstanding_allocations() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::LeakTracking);
    let _a10 = profiler.malloc(10, "A").unwrap();
    let a20 = profiler.malloc(20, "A").unwrap();
    let _b5 = profiler.malloc(5, "B").unwrap();
    unsafe { profiler.free(a20.as_ptr(), "A") }.unwrap();

    let report = profiler.shutdown_report();
    assert_eq!(report.mode, ProfileMode::LeakTracking);
    assert_eq!(report.buckets.len(), 2);
    let a = report.bucket("A").unwrap();
    assert_eq!((a.count, a.total_size, a.peak_size), (1, 10, None));
    let b = report.bucket("B").unwrap();
    assert_eq!((b.count, b.total_size), (1, 5));
    assert_eq!(report.counters.malloc_calls, 3);
    assert_eq!(report.counters.free_calls, 1);
    assert!(report.calls_mismatched);
    assert_eq!(report.leaked_bytes(), 15);
    assert_eq!(report.counters.peak_bytes, 35);
}

#[test]
fn balanced_run_reports_nothing() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::LeakTracking);
    let ptrs: Vec<_> = (0..20).map(|n| profiler.malloc(n, "x").unwrap()).collect();
    for ptr in ptrs {
        unsafe { profiler.free(ptr.as_ptr(), "x") }.unwrap();
    }
    let report = profiler.shutdown_report();
    assert!(report.buckets.is_empty());
    assert!(!report.calls_mismatched);
    assert!(!report.has_leaks());
    assert_eq!(heap.live_blocks(), 0);
}

#[test]
fn double_free_is_rejected_every_time() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::LeakTracking);
    let ptr = profiler.malloc(32, "dup").unwrap();
    unsafe { profiler.free(ptr.as_ptr(), "dup") }.unwrap();
    let after_first = profiler.counters();

    for _ in 0..3 {
        assert_eq!(
            unsafe { profiler.free(ptr.as_ptr(), "dup") },
            Err(FreeFailure::AlreadyFreed { tag: "dup".into() })
        );
    }
    assert_eq!(profiler.counters(), after_first);
    assert_eq!(heap.bad_frees(), 0);
    assert_eq!(heap.deallocations(), 1);
}

#[test]
fn foreign_pointer_is_rejected() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::LeakTracking);
    let _kept = profiler.malloc(8, "kept").unwrap();
    let before = profiler.counters();

    for fill in [0x00, 0x5a, 0xff] {
        let foreign = heap.foreign_payload(fill);
        assert_eq!(
            unsafe { profiler.free(foreign.as_ptr(), "stray") },
            Err(FreeFailure::Unknown {
                tag: "stray".into()
            })
        );
    }
    assert_eq!(profiler.counters(), before);
    assert_eq!(heap.deallocations(), 0);
}

#[test]
fn slot_from_another_profiler_is_a_mismatch() {
    let heap = ArenaHeap::new();
    let mut first = profiler(&heap, ProfileMode::LeakTracking);
    let mut second = profiler(&heap, ProfileMode::LeakTracking);
    let mine = first.malloc(16, "first").unwrap();
    let _theirs = second.malloc(16, "second").unwrap();

    assert_eq!(
        unsafe { second.free(mine.as_ptr(), "first") },
        Err(FreeFailure::SlotMismatch {
            index: 0,
            tag: "first".into()
        })
    );
    assert_eq!(second.counters().free_calls, 0);
    unsafe { first.free(mine.as_ptr(), "first") }.unwrap();
}

#[test]
fn out_of_range_slot_is_rejected() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::LeakTracking);
    let ptr = profiler.malloc(4, "t").unwrap();
    unsafe { set_header_word(ptr, 8, 9_999) };
    assert_eq!(
        unsafe { profiler.free(ptr.as_ptr(), "t") },
        Err(FreeFailure::SlotOutOfRange {
            index: 9_999,
            len: 1,
            tag: "t".into()
        })
    );
    assert_eq!(profiler.counters().live_blocks, 1);
}

#[test]
fn allocation_failure_leaves_profiler_untouched() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::LeakTracking);
    heap.fail_next(1);
    assert_eq!(
        profiler.malloc(64, "oom"),
        Err(AllocFailure::OutOfMemory {
            size: 64,
            tag: "oom".into()
        })
    );
    assert_eq!(profiler.counters(), Counters::default());
    assert_eq!(profiler.ledger_stats().unwrap().len, 0);

    let ptr = profiler.malloc(64, "oom").unwrap();
    unsafe { profiler.free(ptr.as_ptr(), "oom") }.unwrap();
}

#[test]
fn empty_tag_is_rejected() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::LeakTracking);
    assert_eq!(profiler.malloc(1, ""), Err(AllocFailure::EmptyTag));
    assert_eq!(heap.allocations(), 0);
}

#[test]
fn compaction_rebinds_moved_headers() {
    let heap = ArenaHeap::new();
    let config = ProfilerConfig::default().compaction_threshold(4);
    let mut profiler = Profiler::new(&heap, config).unwrap();
    let ptrs: Vec<_> = (0..10).map(|n| profiler.malloc(n + 1, "c").unwrap()).collect();

    for ptr in &ptrs[..4] {
        unsafe { profiler.free(ptr.as_ptr(), "c") }.unwrap();
    }
    let stats = profiler.ledger_stats().unwrap();
    assert_eq!(stats.compactions, 1);
    assert_eq!(stats.len, 6);
    // the first survivor moved from slot 4 to slot 0
    assert_eq!(unsafe { header_word(ptrs[4], 8) }, 0);
    assert_eq!(unsafe { header_word(ptrs[9], 8) }, 5);

    for ptr in &ptrs[4..] {
        unsafe { profiler.free(ptr.as_ptr(), "c") }.unwrap();
    }
    let stats = profiler.ledger_stats().unwrap();
    assert_eq!(stats.slots_probed, 10);
    assert_eq!(stats.compactions, 2);
    assert!(!profiler.shutdown_report().has_leaks());
}

#[test]
fn free_lookup_probes_one_slot() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::LeakTracking);
    let ptrs: Vec<_> = (0..500).map(|_| profiler.malloc(8, "probe").unwrap()).collect();
    for (freed, ptr) in ptrs.iter().rev().enumerate() {
        unsafe { profiler.free(ptr.as_ptr(), "probe") }.unwrap();
        assert_eq!(profiler.ledger_stats().unwrap().slots_probed, freed as u64 + 1);
    }
}

#[test]
fn track_all_keeps_history() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::TrackAll);
    for n in 0..150 {
        let ptr = profiler.malloc(2, if n % 2 == 0 { "even" } else { "odd" }).unwrap();
        unsafe { profiler.free(ptr.as_ptr(), "any") }.unwrap();
    }
    let _live = profiler.malloc(7, "odd").unwrap();

    let stats = profiler.ledger_stats().unwrap();
    assert_eq!(stats.len, 151);
    assert_eq!(stats.compactions, 0);
    assert_eq!(stats.scan_steps, 0);

    let report = profiler.shutdown_report();
    assert_eq!(report.mode, ProfileMode::TrackAll);
    let even = report.bucket("even").unwrap();
    assert_eq!((even.count, even.total_size), (75, 150));
    let odd = report.bucket("odd").unwrap();
    assert_eq!((odd.count, odd.total_size), (76, 157));
    assert_eq!(report.leaked_bytes(), 7);
}

#[test]
fn detailed_mode_tracks_peaks_per_tag() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::Detailed);
    let a10 = profiler.malloc(10, "A").unwrap();
    let a20 = profiler.malloc(20, "A").unwrap();
    let b5 = profiler.malloc(5, "B").unwrap();
    unsafe {
        profiler.free(a20.as_ptr(), "A").unwrap();
        profiler.free(b5.as_ptr(), "B").unwrap();
    }
    assert!(profiler.ledger().is_none());

    let report = profiler.shutdown_report();
    assert_eq!(report.mode, ProfileMode::Detailed);
    assert_eq!(report.buckets[0].tag, "A");
    assert_eq!(
        report.bucket("A").map(|b| (b.count, b.total_size, b.peak_size)),
        Some((1, 10, Some(30)))
    );
    // emptied buckets are still reported
    assert_eq!(
        report.bucket("B").map(|b| (b.count, b.total_size, b.peak_size)),
        Some((0, 0, Some(5)))
    );
    assert_eq!(report.leaked_bytes(), 10);
    let _ = a10;
}

#[test]
fn detailed_mode_refuses_corrupted_headers() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::Detailed);
    let ptr = profiler.malloc(10, "A").unwrap();

    unsafe { set_header_word(ptr, 12, 11) };
    assert!(matches!(
        unsafe { profiler.free(ptr.as_ptr(), "A") },
        Err(FreeFailure::CorruptedBundle { .. })
    ));
    unsafe { set_header_word(ptr, 12, 10) };
    unsafe { set_header_word(ptr, 8, 3) };
    assert!(matches!(
        unsafe { profiler.free(ptr.as_ptr(), "A") },
        Err(FreeFailure::CorruptedBundle { .. })
    ));
    assert_eq!(heap.deallocations(), 0);
    assert_eq!(profiler.counters().live_bytes, 10);

    unsafe { set_header_word(ptr, 8, 0) };
    unsafe { profiler.free(ptr.as_ptr(), "A") }.unwrap();
    assert_eq!(heap.deallocations(), 1);
}

#[test]
fn off_mode_passes_through() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::Off);
    let ptr = profiler.malloc(40, "off").unwrap();
    assert_eq!(ptr.as_ptr() as usize % 16, 0);
    assert_eq!(profiler.counters(), Counters::default());
    unsafe { profiler.free(ptr.as_ptr(), "off") }.unwrap();
    assert_eq!(heap.deallocations(), 1);

    let report = profiler.shutdown_report();
    assert_eq!(report.mode, ProfileMode::Off);
    assert!(report.buckets.is_empty());
    assert!(report.ledger.is_none());
}

#[test]
fn block_from_another_mode_is_refused() {
    let heap = ArenaHeap::new();
    let mut detailed = profiler(&heap, ProfileMode::Detailed);
    let mut off = profiler(&heap, ProfileMode::Off);
    let ptr = detailed.malloc(8, "d").unwrap();

    assert!(matches!(
        unsafe { off.free(ptr.as_ptr(), "d") },
        Err(FreeFailure::ModeMismatch {
            mode: ProfileMode::Off,
            ..
        })
    ));
    unsafe { detailed.free(ptr.as_ptr(), "d") }.unwrap();

    // untracked blocks free anywhere
    let plain = off.malloc(8, "o").unwrap();
    unsafe { detailed.free(plain.as_ptr(), "o") }.unwrap();
    assert_eq!(heap.live_blocks(), 0);
}

#[test]
fn report_is_written_as_json() {
    let heap = ArenaHeap::new();
    let mut profiler = profiler(&heap, ProfileMode::LeakTracking);
    let _ = profiler.malloc(100, "json").unwrap();
    let report = profiler.shutdown_report();

    let path = std::env::temp_dir().join(format!("tagalloc-report-{}.json", std::process::id()));
    report.write_json(&path).unwrap();
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(written["mode"], "leak-tracking");
    assert_eq!(written["counters"]["live_bytes"], 100);
    assert_eq!(written["buckets"][0]["tag"], "json");
    assert_eq!(written["ledger"]["len"], 1);
}
