//! The arena: per-heap bookkeeping and the allocation engine.
//!
//! An [`Arena`] owns a logical address space, a page source, two bitmaps of
//! non-empty bins, 32 small-bin lists, 32 tree-bin roots, the designated
//! victim, the top chunk, and the segment list. All chunk fields are read
//! and written through the checked accessors defined here; the algorithm
//! layers (`bins`, `alloc`, `system`, `free`, `resize`, `walk`) build on
//! them.

mod alloc;
mod bins;
mod free;
mod resize;
mod system;
mod walk;

pub use walk::{ChunkView, HeapStats};

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::chunk::{
    ALIGN_MASK, CHUNK_OVERHEAD, CINUSE, FOOTER_CHUNK_OVERHEAD, INUSE_BITS, MAPPED_TAG,
    MAX_REQUEST, MEM_OFFSET, MMAP_CHUNK_OVERHEAD, NIL, NSMALLBINS, NTREEBINS, PINUSE,
    TOP_FOOT_SIZE, WORD, request_to_chunk,
};
use crate::chunk::{BK_OFFSET, CHILD_OFFSET, FD_OFFSET, INDEX_OFFSET, PARENT_OFFSET};
use crate::config::HeapOptions;
use crate::error::{ErrorPolicy, HeapError};
use crate::mem::AddressSpace;
use crate::os::{PageSource, SystemMemory};
use crate::trace::{EventLevel, EventLog, HeapEvent};

/// Where a segment's space came from, which fixes how it may be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Contiguous-extend space; only its tail can be given back.
    Contiguous,
    /// An independent mapping; can be released as a whole or from its tail.
    Mapped,
    /// Caller-supplied space; never released.
    Extern,
}

/// A contiguous span of address space tracked by an arena.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub base: usize,
    pub size: usize,
    pub kind: SegmentKind,
}

impl Segment {
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn holds(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }
}

static MAGIC_SEED: AtomicUsize = AtomicUsize::new(0x9E37_79B9);

/// Per-arena magic tag; unique across arenas in a process.
fn next_magic() -> usize {
    // splitmix64-style mixer over a process-global counter.
    let mut z = MAGIC_SEED.fetch_add(0x9E37_79B9, Ordering::Relaxed) as u64;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    ((z ^ (z >> 31)) as usize) | 1
}

/// An independent heap instance.
pub struct Arena<S: PageSource = SystemMemory> {
    pub(crate) space: AddressSpace,
    pub(crate) source: S,
    pub(crate) options: HeapOptions,

    pub(crate) smallmap: u32,
    pub(crate) treemap: u32,
    pub(crate) smallbins: [usize; NSMALLBINS],
    pub(crate) treebins: [usize; NTREEBINS],

    pub(crate) dv: usize,
    pub(crate) dvsize: usize,
    pub(crate) top: usize,
    pub(crate) topsize: usize,

    pub(crate) least_addr: usize,
    pub(crate) trim_check: usize,
    pub(crate) magic: usize,
    pub(crate) segments: Vec<Segment>,

    pub(crate) footprint: usize,
    pub(crate) max_footprint: usize,
    pub(crate) corruption_count: u64,

    /// Latched after a failed contiguous extension; further attempts skip
    /// straight to mapping.
    pub(crate) contiguous_failed: bool,
    /// Direct mapping can be suspended (grouped allocation does this so an
    /// aggregate chunk never lands in a dedicated mapping).
    pub(crate) map_enabled: bool,

    pub(crate) events: EventLog,
}

impl Arena<SystemMemory> {
    /// An empty arena over the default system memory. Space is acquired
    /// lazily on first allocation.
    pub fn new(options: HeapOptions) -> Self {
        Self::with_source(SystemMemory::new(), options)
    }
}

impl<S: PageSource> Arena<S> {
    pub fn with_source(source: S, options: HeapOptions) -> Self {
        Self {
            space: AddressSpace::new(),
            source,
            options,
            smallmap: 0,
            treemap: 0,
            smallbins: [NIL; NSMALLBINS],
            treebins: [NIL; NTREEBINS],
            dv: NIL,
            dvsize: 0,
            top: NIL,
            topsize: 0,
            least_addr: usize::MAX,
            trim_check: options.trim_threshold,
            magic: next_magic(),
            segments: Vec::new(),
            footprint: 0,
            max_footprint: 0,
            corruption_count: 0,
            contiguous_failed: false,
            map_enabled: true,
            events: EventLog::new(),
        }
    }

    pub fn options(&self) -> &HeapOptions {
        &self.options
    }

    pub fn set_option(&mut self, option: crate::config::HeapOption, value: usize) -> bool {
        self.options.set(option, value)
    }

    /// Bytes currently obtained from the system.
    pub fn footprint(&self) -> usize {
        self.footprint
    }

    /// Peak system footprint over the arena's lifetime.
    pub fn max_footprint(&self) -> usize {
        self.max_footprint
    }

    /// Usage errors and corruption events survived under the proceed policy.
    pub fn corruption_count(&self) -> u64 {
        self.corruption_count
    }

    /// False once the arena has been destroyed; its magic tag is zeroed so
    /// stale handles can be told apart from live ones.
    pub fn is_live(&self) -> bool {
        self.magic != 0
    }

    /// Drain the lifecycle event journal.
    pub fn drain_events(&mut self) -> Vec<HeapEvent> {
        self.events.drain()
    }

    /// Copy payload bytes out of an allocation.
    pub fn read(&self, ptr: usize, out: &mut [u8]) -> Result<(), HeapError> {
        Ok(self.space.read_bytes(ptr, out)?)
    }

    /// Copy payload bytes into an allocation.
    pub fn write(&mut self, ptr: usize, data: &[u8]) -> Result<(), HeapError> {
        Ok(self.space.write_bytes(ptr, data)?)
    }

    // ---- header words -----------------------------------------------------

    pub(crate) fn head(&self, p: usize) -> Result<usize, HeapError> {
        Ok(self.space.read_word(p + WORD)?)
    }

    pub(crate) fn set_head(&mut self, p: usize, v: usize) -> Result<(), HeapError> {
        Ok(self.space.write_word(p + WORD, v)?)
    }

    pub(crate) fn prev_foot(&self, p: usize) -> Result<usize, HeapError> {
        Ok(self.space.read_word(p)?)
    }

    pub(crate) fn set_prev_foot(&mut self, p: usize, v: usize) -> Result<(), HeapError> {
        Ok(self.space.write_word(p, v)?)
    }

    pub(crate) fn chunksize(&self, p: usize) -> Result<usize, HeapError> {
        Ok(self.head(p)? & !INUSE_BITS)
    }

    pub(crate) fn cinuse(&self, p: usize) -> Result<bool, HeapError> {
        Ok(self.head(p)? & CINUSE != 0)
    }

    pub(crate) fn pinuse(&self, p: usize) -> Result<bool, HeapError> {
        Ok(self.head(p)? & PINUSE != 0)
    }

    pub(crate) fn clear_pinuse(&mut self, p: usize) -> Result<(), HeapError> {
        let h = self.head(p)?;
        self.set_head(p, h & !PINUSE)
    }

    pub(crate) fn next_chunk(&self, p: usize) -> Result<usize, HeapError> {
        Ok(p + self.chunksize(p)?)
    }

    /// A directly mapped chunk carries no PINUSE and tags its map offset.
    pub(crate) fn is_direct(&self, p: usize) -> Result<bool, HeapError> {
        Ok(self.head(p)? & PINUSE == 0 && self.prev_foot(p)? & MAPPED_TAG != 0)
    }

    // ---- free-list and tree fields -----------------------------------------

    pub(crate) fn fd(&self, p: usize) -> Result<usize, HeapError> {
        Ok(self.space.read_word(p + FD_OFFSET)?)
    }

    pub(crate) fn set_fd(&mut self, p: usize, v: usize) -> Result<(), HeapError> {
        Ok(self.space.write_word(p + FD_OFFSET, v)?)
    }

    pub(crate) fn bk(&self, p: usize) -> Result<usize, HeapError> {
        Ok(self.space.read_word(p + BK_OFFSET)?)
    }

    pub(crate) fn set_bk(&mut self, p: usize, v: usize) -> Result<(), HeapError> {
        Ok(self.space.write_word(p + BK_OFFSET, v)?)
    }

    pub(crate) fn child(&self, p: usize, side: usize) -> Result<usize, HeapError> {
        Ok(self.space.read_word(p + CHILD_OFFSET[side])?)
    }

    pub(crate) fn set_child(&mut self, p: usize, side: usize, v: usize) -> Result<(), HeapError> {
        Ok(self.space.write_word(p + CHILD_OFFSET[side], v)?)
    }

    pub(crate) fn tparent(&self, p: usize) -> Result<usize, HeapError> {
        Ok(self.space.read_word(p + PARENT_OFFSET)?)
    }

    pub(crate) fn set_tparent(&mut self, p: usize, v: usize) -> Result<(), HeapError> {
        Ok(self.space.write_word(p + PARENT_OFFSET, v)?)
    }

    pub(crate) fn tindex(&self, p: usize) -> Result<usize, HeapError> {
        Ok(self.space.read_word(p + INDEX_OFFSET)?)
    }

    pub(crate) fn set_tindex(&mut self, p: usize, v: usize) -> Result<(), HeapError> {
        Ok(self.space.write_word(p + INDEX_OFFSET, v)?)
    }

    // ---- in-use transitions -------------------------------------------------

    pub(crate) fn chunk_overhead(&self) -> usize {
        if self.options.footers {
            FOOTER_CHUNK_OVERHEAD
        } else {
            CHUNK_OVERHEAD
        }
    }

    pub(crate) fn overhead_for(&self, p: usize) -> Result<usize, HeapError> {
        Ok(if self.is_direct(p)? {
            MMAP_CHUNK_OVERHEAD
        } else {
            self.chunk_overhead()
        })
    }

    /// Round a caller request to a chunk size, failing fast on the ceiling.
    pub(crate) fn request_to_chunk(&self, bytes: usize) -> Result<usize, HeapError> {
        if bytes >= MAX_REQUEST {
            return Err(HeapError::AllocationFailed { requested: bytes });
        }
        Ok(request_to_chunk(bytes, self.chunk_overhead()))
    }

    /// Footer tag written at the foot of every in-use chunk when enabled.
    fn mark_footer(&mut self, p: usize, size: usize) -> Result<(), HeapError> {
        if self.options.footers {
            let magic = self.magic;
            self.set_prev_foot(p + size, magic)?;
        }
        Ok(())
    }

    /// Verify the footer tag of an in-use chunk.
    pub(crate) fn check_footer(&self, p: usize) -> Result<(), HeapError> {
        if self.options.footers {
            let size = self.chunksize(p)?;
            if self.prev_foot(p + size)? != self.magic {
                return Err(HeapError::UsageError {
                    addr: p,
                    reason: "footer tag mismatch (foreign arena or overflow)",
                });
            }
        }
        Ok(())
    }

    pub(crate) fn set_size_and_pinuse_of_free_chunk(
        &mut self,
        p: usize,
        size: usize,
    ) -> Result<(), HeapError> {
        self.set_head(p, size | PINUSE)?;
        // Foot of a free chunk: its size, readable by the next chunk.
        self.set_prev_foot(p + size, size)
    }

    pub(crate) fn set_free_with_pinuse(
        &mut self,
        p: usize,
        size: usize,
        next: usize,
    ) -> Result<(), HeapError> {
        self.clear_pinuse(next)?;
        self.set_size_and_pinuse_of_free_chunk(p, size)
    }

    pub(crate) fn set_size_and_pinuse_of_inuse_chunk(
        &mut self,
        p: usize,
        size: usize,
    ) -> Result<(), HeapError> {
        self.set_head(p, size | PINUSE | CINUSE)?;
        self.mark_footer(p, size)
    }

    pub(crate) fn set_inuse(&mut self, p: usize, size: usize) -> Result<(), HeapError> {
        let h = self.head(p)?;
        self.set_head(p, (h & PINUSE) | size | CINUSE)?;
        let next_head = self.head(p + size)?;
        self.set_head(p + size, next_head | PINUSE)?;
        self.mark_footer(p, size)
    }

    pub(crate) fn set_inuse_and_pinuse(&mut self, p: usize, size: usize) -> Result<(), HeapError> {
        self.set_head(p, size | PINUSE | CINUSE)?;
        let next_head = self.head(p + size)?;
        self.set_head(p + size, next_head | PINUSE)?;
        self.mark_footer(p, size)
    }

    // ---- defensive checks ----------------------------------------------------

    /// Address sanity for chunks reached via stored links or offsets.
    pub(crate) fn ok_address(&self, p: usize) -> bool {
        p >= self.least_addr && p & ALIGN_MASK == 0 && self.space.contains(p)
    }

    pub(crate) fn check_link(&self, p: usize, what: &'static str) -> Result<(), HeapError> {
        if self.ok_address(p) {
            Ok(())
        } else {
            Err(HeapError::Corruption { addr: p, what })
        }
    }

    // ---- bitmaps ---------------------------------------------------------------

    pub(crate) fn mark_smallmap(&mut self, idx: usize) {
        self.smallmap |= 1 << idx;
    }

    pub(crate) fn clear_smallmap(&mut self, idx: usize) {
        self.smallmap &= !(1 << idx);
    }

    pub(crate) fn smallmap_is_marked(&self, idx: usize) -> bool {
        self.smallmap & (1 << idx) != 0
    }

    pub(crate) fn mark_treemap(&mut self, idx: usize) {
        self.treemap |= 1 << idx;
    }

    pub(crate) fn clear_treemap(&mut self, idx: usize) {
        self.treemap &= !(1 << idx);
    }

    pub(crate) fn treemap_is_marked(&self, idx: usize) -> bool {
        self.treemap & (1 << idx) != 0
    }

    // ---- segments ----------------------------------------------------------------

    pub(crate) fn segment_holding(&self, addr: usize) -> Option<usize> {
        self.segments.iter().position(|s| s.holds(addr))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    // ---- top management --------------------------------------------------------

    /// Install `p` as the top chunk with `size` usable bytes. The reserved
    /// tail beyond it keeps room for fenceposts when the segment is split
    /// or extended later.
    pub(crate) fn init_top(&mut self, p: usize, size: usize) -> Result<(), HeapError> {
        debug_assert!(p & ALIGN_MASK == 0);
        self.top = p;
        self.topsize = size;
        self.set_head(p, size | PINUSE)?;
        self.set_head(p + size, TOP_FOOT_SIZE)?;
        self.trim_check = self.options.trim_threshold;
        Ok(())
    }

    pub(crate) fn should_trim(&self, size: usize) -> bool {
        size > self.trim_check
    }

    // ---- error policy -------------------------------------------------------------

    /// Forget all heap memory after corruption under the proceed policy.
    /// The arena keeps running with empty bins; previously freed chunks are
    /// abandoned.
    pub(crate) fn reset_on_error(&mut self) {
        self.corruption_count += 1;
        self.smallmap = 0;
        self.treemap = 0;
        self.smallbins = [NIL; NSMALLBINS];
        self.treebins = [NIL; NTREEBINS];
        self.dv = NIL;
        self.dvsize = 0;
        self.top = NIL;
        self.topsize = 0;
        self.segments.clear();
    }

    /// Apply the arena's error policy to an operation result.
    pub(crate) fn absorb<T>(&mut self, res: Result<T, HeapError>) -> Option<T> {
        match res {
            Ok(v) => Some(v),
            Err(err) if err.is_fatal() => {
                let fp = self.footprint;
                self.events
                    .record(EventLevel::Error, "usage_error", None, None, fp);
                match self.options.on_error {
                    ErrorPolicy::Abort => panic!("ferroheap: {err}"),
                    ErrorPolicy::Proceed => {
                        self.reset_on_error();
                        None
                    }
                }
            }
            Err(err) => {
                let size = match err {
                    HeapError::AllocationFailed { requested } => Some(requested),
                    _ => None,
                };
                self.record_event(EventLevel::Warn, "alloc_failed", None, size);
                None
            }
        }
    }

    pub(crate) fn record_event(
        &mut self,
        level: EventLevel,
        kind: &'static str,
        addr: Option<usize>,
        size: Option<usize>,
    ) {
        let fp = self.footprint;
        self.events.record(level, kind, addr, size, fp);
    }

    pub(crate) fn bump_footprint(&mut self, bytes: usize) {
        self.footprint += bytes;
        if self.footprint > self.max_footprint {
            self.max_footprint = self.footprint;
        }
    }

    /// Payload address of a validated in-use chunk.
    pub(crate) fn mem_for(&self, p: usize) -> usize {
        p + MEM_OFFSET
    }

    /// Chunk address for a caller pointer.
    pub(crate) fn chunk_for(&self, mem: usize) -> usize {
        mem - MEM_OFFSET
    }
}
