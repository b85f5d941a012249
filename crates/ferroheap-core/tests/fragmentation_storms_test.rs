use ferroheap_core::{Heap, HeapOption, HeapOptions};
use serde_json::json;
use std::collections::HashSet;

const TARGET_OPS: usize = 60_000;

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy, Debug)]
enum StormType {
    Sawtooth,
    RandomChurn,
    SizeClassThrash,
    AlignmentStress,
    DrainAndRefill,
}

impl StormType {
    fn as_str(self) -> &'static str {
        match self {
            StormType::Sawtooth => "sawtooth",
            StormType::RandomChurn => "random_churn",
            StormType::SizeClassThrash => "size_class_thrash",
            StormType::AlignmentStress => "alignment_stress",
            StormType::DrainAndRefill => "drain_and_refill",
        }
    }

    fn all() -> [StormType; 5] {
        [
            StormType::Sawtooth,
            StormType::RandomChurn,
            StormType::SizeClassThrash,
            StormType::AlignmentStress,
            StormType::DrainAndRefill,
        ]
    }
}

#[derive(Debug, Clone, Copy)]
struct AllocationRec {
    ptr: usize,
    requested_size: usize,
}

#[derive(Debug, Clone)]
struct StormMetrics {
    storm_type: &'static str,
    ops_count: usize,
    peak_footprint: usize,
    final_footprint: usize,
    peak_live_bytes: usize,
    trims_observed: usize,
    integrity_check_passed: bool,
}

struct StormRunner {
    heap: Heap,
    slots: Vec<Option<AllocationRec>>,
    rng: XorShift64,
    ops_count: usize,
    live_bytes: usize,
    peak_live_bytes: usize,
    peak_footprint: usize,
    trims_observed: usize,
}

impl StormRunner {
    fn new(seed: u64, slot_capacity: usize) -> Self {
        let heap = Heap::new(HeapOptions::default());
        // A tight trim threshold makes storms exercise the release path.
        heap.set_option(HeapOption::TrimThreshold, 256 * 1024);
        Self {
            heap,
            slots: vec![None; slot_capacity],
            rng: XorShift64::new(seed),
            ops_count: 0,
            live_bytes: 0,
            peak_live_bytes: 0,
            peak_footprint: 0,
            trims_observed: 0,
        }
    }

    fn sample(&mut self) {
        self.ops_count += 1;
        self.peak_footprint = self.peak_footprint.max(self.heap.footprint());
        self.peak_live_bytes = self.peak_live_bytes.max(self.live_bytes);
    }

    fn allocate_at(&mut self, idx: usize, size: usize, align: usize) -> bool {
        if self.slots[idx].is_some() {
            self.sample();
            return false;
        }
        let ptr = if align <= 16 {
            self.heap.allocate(size)
        } else {
            self.heap.allocate_aligned(align, size)
        };
        let Some(ptr) = ptr else {
            self.sample();
            return false;
        };
        assert_eq!(ptr % align.max(16), 0, "alignment violated");
        self.slots[idx] = Some(AllocationRec {
            ptr,
            requested_size: size,
        });
        self.live_bytes += size;
        self.sample();
        true
    }

    fn free_at(&mut self, idx: usize) -> bool {
        let Some(rec) = self.slots[idx].take() else {
            self.sample();
            return false;
        };
        self.heap.release(rec.ptr);
        self.live_bytes -= rec.requested_size;
        self.sample();
        true
    }

    fn run_sawtooth(&mut self) {
        while self.ops_count < TARGET_OPS {
            let phase = self.ops_count % (self.slots.len() * 2);
            if phase < self.slots.len() {
                let size = 256 + ((phase * 37) % 12_288);
                if !self.allocate_at(phase, size, 16) {
                    let _ = self.free_at(phase);
                }
            } else {
                let idx = phase - self.slots.len();
                if !self.free_at(idx) {
                    let size = 512 + ((idx * 23) % 4_096);
                    let _ = self.allocate_at(idx, size, 16);
                }
            }
        }
    }

    fn run_random_churn(&mut self) {
        while self.ops_count < TARGET_OPS {
            let idx = self.rng.gen_range(0, self.slots.len() - 1);
            if self.rng.next_u64() & 1 == 0 {
                let size = self.rng.gen_range(16, 16_384);
                if !self.allocate_at(idx, size, 16) {
                    let _ = self.free_at(idx);
                }
            } else if !self.free_at(idx) {
                let size = self.rng.gen_range(16, 8_192);
                let _ = self.allocate_at(idx, size, 16);
            }
        }
    }

    fn run_size_class_thrash(&mut self) {
        let size_classes = [
            16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 1024, 2048, 4096,
        ];
        while self.ops_count < TARGET_OPS {
            let idx = self.rng.gen_range(0, self.slots.len() - 1);
            let size = size_classes[self.rng.gen_range(0, size_classes.len() - 1)];
            if self.ops_count % 3 == 0 {
                if !self.free_at(idx) {
                    let _ = self.allocate_at(idx, size, 16);
                }
            } else if !self.allocate_at(idx, size, 16) {
                let _ = self.free_at(idx);
            }
        }
    }

    fn run_alignment_stress(&mut self) {
        let alignments = [16usize, 64, 256, 4096, 65_536];
        while self.ops_count < TARGET_OPS {
            let idx = self.rng.gen_range(0, self.slots.len() - 1);
            let align = alignments[self.rng.gen_range(0, alignments.len() - 1)];
            let size = self.rng.gen_range(64, 4096);
            if self.ops_count % 4 != 0 {
                if !self.allocate_at(idx, size, align) {
                    let _ = self.free_at(idx);
                }
            } else if !self.free_at(idx) {
                let _ = self.allocate_at(idx, size, align);
            }
        }
    }

    /// Fill the heap, drain it completely, and require the footprint to
    /// come back down: the drained segments must be trimmed or released.
    fn run_drain_and_refill(&mut self) {
        while self.ops_count < TARGET_OPS {
            for idx in 0..self.slots.len() {
                let size = 1024 + ((idx * 97) % 24_576);
                let _ = self.allocate_at(idx, size, 16);
            }
            let filled_footprint = self.heap.footprint();
            for idx in 0..self.slots.len() {
                let _ = self.free_at(idx);
            }
            if self.heap.trim(0) {
                self.trims_observed += 1;
            }
            assert!(
                self.heap.footprint() < filled_footprint,
                "drained heap must shrink (was {filled_footprint}, now {})",
                self.heap.footprint()
            );
        }
    }

    fn run_storm(&mut self, storm: StormType) {
        match storm {
            StormType::Sawtooth => self.run_sawtooth(),
            StormType::RandomChurn => self.run_random_churn(),
            StormType::SizeClassThrash => self.run_size_class_thrash(),
            StormType::AlignmentStress => self.run_alignment_stress(),
            StormType::DrainAndRefill => self.run_drain_and_refill(),
        }
    }

    fn verify_integrity(&self) -> bool {
        let mut ptrs = HashSet::new();
        for rec in self.slots.iter().flatten() {
            if !ptrs.insert(rec.ptr) {
                return false;
            }
            if self.heap.usable_size(rec.ptr) < rec.requested_size {
                return false;
            }
        }
        self.heap.check_integrity().is_ok()
    }

    fn finish(mut self, storm: StormType) -> StormMetrics {
        let integrity_check_passed = self.verify_integrity();
        for idx in 0..self.slots.len() {
            let _ = self.free_at(idx);
        }
        self.heap.trim(0);
        StormMetrics {
            storm_type: storm.as_str(),
            ops_count: self.ops_count,
            peak_footprint: self.peak_footprint,
            final_footprint: self.heap.footprint(),
            peak_live_bytes: self.peak_live_bytes,
            trims_observed: self.trims_observed,
            integrity_check_passed,
        }
    }
}

fn run_single_storm(storm: StormType) -> StormMetrics {
    let seed = match storm {
        StormType::Sawtooth => 0xA11CE,
        StormType::RandomChurn => 0xC0FFEE,
        StormType::SizeClassThrash => 0xD00D,
        StormType::AlignmentStress => 0xF00D,
        StormType::DrainAndRefill => 0xBEEF,
    };
    let slot_capacity = if matches!(storm, StormType::AlignmentStress) {
        64
    } else {
        256
    };
    let mut runner = StormRunner::new(seed, slot_capacity);
    runner.run_storm(storm);
    runner.finish(storm)
}

#[test]
fn fragmentation_storms_suite_emits_metrics() {
    let storms: Vec<StormMetrics> = StormType::all().into_iter().map(run_single_storm).collect();

    for storm in &storms {
        assert!(
            storm.ops_count >= TARGET_OPS,
            "storm {} ran insufficient ops: {}",
            storm.storm_type,
            storm.ops_count
        );
        assert!(
            storm.integrity_check_passed,
            "storm {} failed integrity check",
            storm.storm_type
        );
        assert!(
            storm.peak_footprint >= storm.peak_live_bytes,
            "storm {} footprint below live bytes",
            storm.storm_type
        );
        assert!(
            storm.final_footprint <= storm.peak_footprint,
            "storm {} grew after draining",
            storm.storm_type
        );
    }

    let payload = json!({
        "suite": "fragmentation_storms",
        "storm_results": storms.iter().map(|s| json!({
            "storm_type": s.storm_type,
            "ops_count": s.ops_count,
            "peak_footprint": s.peak_footprint,
            "final_footprint": s.final_footprint,
            "peak_live_bytes": s.peak_live_bytes,
            "trims_observed": s.trims_observed,
            "integrity_check_passed": s.integrity_check_passed,
        })).collect::<Vec<_>>()
    });

    println!("FRAGMENTATION_STORM_REPORT {payload}");
}
