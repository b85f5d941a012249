//! Independent heap instances and the process-wide default heap.
//!
//! A [`Heap`] is a cloneable, thread-safe handle to one arena: every
//! operation takes the arena's mutex for its duration and verifies the
//! arena's magic tag first, so a handle that outlives `destroy` raises a
//! usage error instead of touching freed bookkeeping. Callers who want the
//! original's unlocked single-thread variant hold an
//! [`Arena`](crate::heap::Arena) directly and synchronize externally; the
//! `locked` creation flag is recorded on the options either way.
//!
//! The default heap is an explicit singleton constructed on first use and
//! never torn down.

use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use crate::config::{HeapOption, HeapOptions};
use crate::error::HeapError;
use crate::heap::{Arena, HeapStats};
use crate::os::SystemMemory;
use crate::trace::HeapEvent;

/// Shareable handle to an independent heap instance.
#[derive(Clone)]
pub struct Heap {
    inner: Arc<Mutex<Arena<SystemMemory>>>,
}

impl Heap {
    /// An empty heap that acquires space lazily on first allocation.
    pub fn new(options: HeapOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Arena::new(options))),
        }
    }

    /// A heap primed with an initial mapped segment of at least `capacity`
    /// usable bytes (one growth unit when `capacity` is 0). Returns `None`
    /// if the system refuses the initial mapping.
    pub fn with_capacity(capacity: usize, locked: bool) -> Option<Self> {
        let options = HeapOptions {
            locked,
            ..HeapOptions::default()
        };
        let mut arena = Arena::new(options);
        arena.prime(capacity).ok()?;
        Some(Self {
            inner: Arc::new(Mutex::new(arena)),
        })
    }

    /// A heap built over a caller-supplied region at `base`. The region is
    /// never merged, trimmed, or released, including by `destroy`.
    pub fn over_region(base: usize, capacity: usize, locked: bool) -> Option<Self> {
        let options = HeapOptions {
            locked,
            ..HeapOptions::default()
        };
        let mut arena = Arena::new(options);
        arena.adopt_region(base, capacity).ok()?;
        Some(Self {
            inner: Arc::new(Mutex::new(arena)),
        })
    }

    /// Run `op` against the arena after the magic-tag check. A stale handle
    /// (destroyed arena) is a usage error routed through the arena policy.
    fn dispatch<R>(&self, op: impl FnOnce(&mut Arena<SystemMemory>) -> R) -> Option<R> {
        let mut arena = self.inner.lock();
        if !arena.is_live() {
            let res: Result<(), HeapError> = Err(HeapError::UsageError {
                addr: 0,
                reason: "operation on a destroyed heap handle",
            });
            arena.absorb(res);
            return None;
        }
        Some(op(&mut arena))
    }

    pub fn allocate(&self, size: usize) -> Option<usize> {
        self.dispatch(|a| a.allocate(size))?
    }

    pub fn allocate_zeroed(&self, count: usize, elem_size: usize) -> Option<usize> {
        self.dispatch(|a| a.allocate_zeroed(count, elem_size))?
    }

    pub fn release(&self, ptr: usize) {
        self.dispatch(|a| a.release(ptr));
    }

    pub fn resize(&self, ptr: usize, new_size: usize) -> Option<usize> {
        self.dispatch(|a| a.resize(ptr, new_size))?
    }

    pub fn allocate_aligned(&self, alignment: usize, size: usize) -> Option<usize> {
        self.dispatch(|a| a.allocate_aligned(alignment, size))?
    }

    pub fn allocate_page_aligned(&self, size: usize) -> Option<usize> {
        self.dispatch(|a| a.allocate_page_aligned(size))?
    }

    pub fn allocate_whole_pages(&self, size: usize) -> Option<usize> {
        self.dispatch(|a| a.allocate_whole_pages(size))?
    }

    pub fn allocate_grouped_zeroed(&self, n: usize, elem_size: usize) -> Option<Vec<usize>> {
        self.dispatch(|a| a.allocate_grouped_zeroed(n, elem_size))?
    }

    pub fn allocate_grouped_varying(&self, sizes: &[usize]) -> Option<Vec<usize>> {
        self.dispatch(|a| a.allocate_grouped_varying(sizes))?
    }

    /// Release top slack beyond `pad`; true if anything went back to the
    /// system.
    pub fn trim(&self, pad: usize) -> bool {
        self.dispatch(|a| a.trim(pad)).unwrap_or(false)
    }

    pub fn usable_size(&self, ptr: usize) -> usize {
        self.dispatch(|a| a.usable_size(ptr)).unwrap_or(0)
    }

    pub fn footprint(&self) -> usize {
        self.dispatch(|a| a.footprint()).unwrap_or(0)
    }

    pub fn max_footprint(&self) -> usize {
        self.dispatch(|a| a.max_footprint()).unwrap_or(0)
    }

    pub fn set_option(&self, option: HeapOption, value: usize) -> bool {
        self.dispatch(|a| a.set_option(option, value))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> Option<HeapStats> {
        self.dispatch(|a| a.stats().ok())?
    }

    /// Full structural verification; linear in live chunks.
    pub fn check_integrity(&self) -> Result<(), HeapError> {
        self.dispatch(|a| a.check_integrity())
            .unwrap_or(Err(HeapError::UsageError {
                addr: 0,
                reason: "operation on a destroyed heap handle",
            }))
    }

    /// Copy payload bytes out of an allocation.
    pub fn read(&self, ptr: usize, out: &mut [u8]) -> Result<(), HeapError> {
        self.dispatch(|a| a.read(ptr, out))
            .unwrap_or(Err(HeapError::UsageError {
                addr: ptr,
                reason: "operation on a destroyed heap handle",
            }))
    }

    /// Copy payload bytes into an allocation.
    pub fn write(&self, ptr: usize, data: &[u8]) -> Result<(), HeapError> {
        self.dispatch(|a| a.write(ptr, data))
            .unwrap_or(Err(HeapError::UsageError {
                addr: ptr,
                reason: "operation on a destroyed heap handle",
            }))
    }

    /// Drain the lifecycle journal. Works on stale handles too, so the
    /// events leading up to a destroy stay observable.
    pub fn drain_events(&self) -> Vec<HeapEvent> {
        self.inner.lock().drain_events()
    }

    /// Usage errors and corruption survived under the proceed policy.
    /// Works on stale handles too.
    pub fn corruption_count(&self) -> u64 {
        self.inner.lock().corruption_count()
    }

    /// Release all owned segments back to the system and poison the arena.
    /// Returns bytes released. Surviving clones fail the magic check
    /// afterwards.
    pub fn destroy(self) -> usize {
        let mut arena = self.inner.lock();
        if !arena.is_live() {
            return 0;
        }
        arena.destroy()
    }
}

static DEFAULT_HEAP: LazyLock<Heap> = LazyLock::new(|| Heap::new(HeapOptions::default()));

/// The process-wide default heap, initialized on first use and never
/// destroyed.
pub fn default_heap() -> &'static Heap {
    &DEFAULT_HEAP
}
