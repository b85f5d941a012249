use ferroheap_core::{EventLevel, Heap, HeapOption, HeapOptions};

/// Freed small slots are reused before any segment growth.
#[test]
fn freed_small_slot_is_reused_before_growth() {
    let heap = Heap::new(HeapOptions::default());
    let a = heap.allocate(24).expect("a");
    let _b = heap.allocate(24).expect("b");
    let footprint = heap.footprint();

    heap.release(a);
    let c = heap.allocate(24).expect("c");
    assert_eq!(c, a, "third allocation reuses the freed slot");
    assert_eq!(heap.footprint(), footprint, "no growth occurred");
}

/// A huge allocation is served by a dedicated mapping whose release is a
/// single unmap that leaves bin state alone.
#[test]
fn huge_allocation_uses_one_dedicated_mapping() {
    let heap = Heap::new(HeapOptions::default());
    heap.allocate(64).expect("warm up");
    heap.drain_events();

    let huge = heap.allocate(1024 * 1024).expect("huge");
    let events = heap.drain_events();
    assert_eq!(
        events.iter().filter(|e| e.kind == "direct_map").count(),
        1,
        "exactly one dedicated mapping"
    );

    let stats_before = heap.stats().expect("stats");
    heap.release(huge);
    let events = heap.drain_events();
    assert_eq!(
        events.iter().filter(|e| e.kind == "direct_unmap").count(),
        1,
        "exactly one unmap on release"
    );
    let stats_after = heap.stats().expect("stats");
    assert_eq!(stats_after.mapped_bytes, 0);
    assert_eq!(
        stats_after.arena_bytes, stats_before.arena_bytes,
        "ordinary segments untouched"
    );
    assert_eq!(
        stats_after.free_bytes, stats_before.free_bytes,
        "bin state untouched by the direct release"
    );
}

/// Draining a heap back to empty lets trim shrink the footprint.
#[test]
fn drained_heap_trims_back_to_the_system() {
    let heap = Heap::new(HeapOptions::default());
    heap.set_option(HeapOption::TrimThreshold, 128 * 1024);

    let mut live = Vec::new();
    for i in 0..200 {
        live.push(heap.allocate(1024 + (i % 13) * 512).expect("fill"));
    }
    let peak = heap.footprint();

    for ptr in live {
        heap.release(ptr);
    }
    heap.trim(0);
    assert!(
        heap.footprint() < peak,
        "footprint must shrink after drain (peak {peak}, now {})",
        heap.footprint()
    );
    let trims = heap
        .drain_events()
        .into_iter()
        .filter(|e| e.level >= EventLevel::Info && (e.kind == "trim" || e.kind == "segment_release"))
        .count();
    assert!(trims > 0, "a trim or segment release must have happened");
}

/// Grouped zeroed allocation: contiguous, zero-filled, individually
/// freeable elements.
#[test]
fn grouped_zeroed_three_elements() {
    let heap = Heap::new(HeapOptions::default());
    // Dirty the heap first so zeroing is observable.
    let dirty = heap.allocate(512).expect("dirty");
    heap.write(dirty, &[0xAB; 512]).expect("fill");
    heap.release(dirty);

    let ptrs = heap.allocate_grouped_zeroed(3, 16).expect("grouped");
    assert_eq!(ptrs.len(), 3);
    for w in ptrs.windows(2) {
        assert!(w[0] < w[1], "elements in address order");
        assert!(w[1] - w[0] <= 64, "elements contiguous");
    }
    for &p in &ptrs {
        let mut out = [0xFFu8; 16];
        heap.read(p, &mut out).expect("read");
        assert_eq!(out, [0u8; 16], "zero-filled");
    }
    for &p in &ptrs {
        heap.release(p);
    }
    heap.check_integrity().expect("after grouped release");
}

#[test]
fn resize_preserves_overlapping_bytes_across_class_changes() {
    let heap = Heap::new(HeapOptions::default());
    let sizes = [24usize, 100, 255, 300, 4096, 40 * 1024, 400 * 1024];
    for (i, &from) in sizes.iter().enumerate() {
        for &to in &sizes[..i] {
            let p = heap.allocate(from).expect("alloc");
            let payload: Vec<u8> = (0..from).map(|b| (b * 31 + i) as u8).collect();
            heap.write(p, &payload).expect("write");

            let q = heap.resize(p, to).expect("resize");
            let keep = from.min(to);
            let mut out = vec![0u8; keep];
            heap.read(q, &mut out).expect("read");
            assert_eq!(out, payload[..keep], "resize {from} -> {to}");
            heap.release(q);
        }
    }
}

#[test]
fn option_knobs_follow_the_contract() {
    let heap = Heap::new(HeapOptions::default());
    assert!(heap.set_option(HeapOption::TrimThreshold, 1));
    assert!(heap.set_option(HeapOption::MapThreshold, 64 * 1024));
    assert!(!heap.set_option(HeapOption::Granularity, 12345));
    assert!(heap.set_option(HeapOption::Granularity, 128 * 1024));

    // The lowered map threshold reroutes mid-sized requests.
    heap.allocate(16).expect("warm up");
    heap.drain_events();
    let p = heap.allocate(100 * 1024).expect("mapped now");
    assert!(
        heap.drain_events().iter().any(|e| e.kind == "direct_map"),
        "lowered threshold sends 100K to a dedicated mapping"
    );
    heap.release(p);
}

#[test]
fn footprint_never_exceeds_peak() {
    let heap = Heap::new(HeapOptions::default());
    let mut live = Vec::new();
    for i in 0..64 {
        live.push(heap.allocate(512 * (1 + i % 9)).expect("alloc"));
        assert!(heap.max_footprint() >= heap.footprint());
    }
    for p in live {
        heap.release(p);
        assert!(heap.max_footprint() >= heap.footprint());
    }
}
