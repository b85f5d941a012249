//! # ferroheap-core
//!
//! A general-purpose heap engine in safe Rust: segregated free lists for
//! small sizes, binary-trie tree bins for large sizes, boundary-tag
//! coalescing, designated-victim locality, segment-based growth with
//! trimming, and dedicated mappings for oversized requests. Multiple
//! independent heap instances ([`Heap`]) are supported alongside a
//! process-wide default heap.
//!
//! Chunks live in a logical address space of byte regions and are handled
//! as checked offsets, never raw pointers, so the whole engine compiles
//! under `deny(unsafe_code)`: a corrupted offset surfaces as a typed error
//! routed through the arena's abort-or-proceed policy instead of undefined
//! behavior.
//!
//! ```
//! use ferroheap_core as heap;
//!
//! let p = heap::allocate(100).expect("out of memory");
//! heap::write(p, b"hello").expect("payload write");
//! assert!(heap::usable_size(p) >= 100);
//! heap::release(p);
//! ```

#![deny(unsafe_code)]

pub mod chunk;
pub mod config;
pub mod error;
pub mod heap;
pub mod mem;
pub mod mspace;
pub mod os;
pub mod trace;

pub use config::{HeapOption, HeapOptions};
pub use error::{ErrorPolicy, HeapError};
pub use heap::{Arena, ChunkView, HeapStats, Segment, SegmentKind};
pub use mspace::{Heap, default_heap};
pub use os::{ContiguousMemory, MappedMemory, PageSource, SystemMemory};
pub use trace::{EventLevel, HeapEvent};

/// Allocate from the default heap.
pub fn allocate(size: usize) -> Option<usize> {
    default_heap().allocate(size)
}

/// Release an allocation made on the default heap.
pub fn release(ptr: usize) {
    default_heap().release(ptr);
}

/// Zeroed multi-element allocation from the default heap.
pub fn allocate_zeroed(count: usize, elem_size: usize) -> Option<usize> {
    default_heap().allocate_zeroed(count, elem_size)
}

/// Resize a default-heap allocation.
pub fn resize(ptr: usize, new_size: usize) -> Option<usize> {
    default_heap().resize(ptr, new_size)
}

/// Aligned allocation from the default heap.
pub fn allocate_aligned(alignment: usize, size: usize) -> Option<usize> {
    default_heap().allocate_aligned(alignment, size)
}

/// Grouped zeroed allocation from the default heap.
pub fn allocate_grouped_zeroed(n: usize, elem_size: usize) -> Option<Vec<usize>> {
    default_heap().allocate_grouped_zeroed(n, elem_size)
}

/// Grouped allocation with per-element sizes from the default heap.
pub fn allocate_grouped_varying(sizes: &[usize]) -> Option<Vec<usize>> {
    default_heap().allocate_grouped_varying(sizes)
}

/// Trim the default heap's top slack beyond `pad`.
pub fn trim(pad: usize) -> bool {
    default_heap().trim(pad)
}

/// Usable payload size behind a default-heap allocation.
pub fn usable_size(ptr: usize) -> usize {
    default_heap().usable_size(ptr)
}

/// Current system footprint of the default heap.
pub fn footprint() -> usize {
    default_heap().footprint()
}

/// Peak system footprint of the default heap.
pub fn max_footprint() -> usize {
    default_heap().max_footprint()
}

/// Change a runtime option on the default heap.
pub fn set_option(option: HeapOption, value: usize) -> bool {
    default_heap().set_option(option, value)
}

/// Accounting snapshot of the default heap.
pub fn stats() -> Option<HeapStats> {
    default_heap().stats()
}

/// Read payload bytes from a default-heap allocation.
pub fn read(ptr: usize, out: &mut [u8]) -> Result<(), HeapError> {
    default_heap().read(ptr, out)
}

/// Write payload bytes into a default-heap allocation.
pub fn write(ptr: usize, data: &[u8]) -> Result<(), HeapError> {
    default_heap().write(ptr, data)
}

#[cfg(test)]
mod tests {
    #[test]
    fn default_heap_free_functions() {
        let p = super::allocate(48).expect("alloc");
        assert!(super::usable_size(p) >= 48);
        assert!(super::footprint() > 0);
        assert!(super::max_footprint() >= super::footprint());

        super::write(p, &[1, 2, 3]).expect("write");
        let mut out = [0u8; 3];
        super::read(p, &mut out).expect("read");
        assert_eq!(out, [1, 2, 3]);

        let q = super::resize(p, 4096).expect("resize");
        super::read(q, &mut out).expect("read after resize");
        assert_eq!(out, [1, 2, 3]);
        super::release(q);
    }
}
