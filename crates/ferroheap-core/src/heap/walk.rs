//! Full-heap traversal, invariant checking, and statistics.
//!
//! The walk visits every chunk of every segment in address order, stopping
//! at the fencepost area that guards each segment's tail. The checker
//! enforces the structural invariants the allocator relies on, above all
//! that no two physically adjacent chunks are both free, and is what the
//! property tests drive after every operation window.

use serde::Serialize;

use crate::chunk::{
    ALIGN_MASK, INUSE_BITS, MIN_CHUNK_SIZE, NIL, WORD, is_small, small_index, tree_index,
};
use crate::error::HeapError;
use crate::os::PageSource;

use super::{Arena, Segment};

/// One chunk as seen by a heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkView {
    pub addr: usize,
    pub size: usize,
    pub in_use: bool,
    pub is_top: bool,
}

/// Point-in-time accounting snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    /// Bytes in ordinary segments.
    pub arena_bytes: usize,
    /// Bytes in dedicated mappings for oversized chunks.
    pub mapped_bytes: usize,
    /// Peak total footprint ever reached.
    pub peak_bytes: usize,
    /// Bytes inside in-use chunks (including direct mappings).
    pub used_bytes: usize,
    /// Bytes inside free chunks, top included.
    pub free_bytes: usize,
    /// Top-chunk bytes, the portion a trim could give back.
    pub trimmable_bytes: usize,
}

impl<S: PageSource> Arena<S> {
    /// Usable payload bytes behind an allocation, or 0 for anything that is
    /// not a live allocation.
    pub fn usable_size(&self, mem: usize) -> usize {
        if mem < crate::chunk::MEM_OFFSET {
            return 0;
        }
        let p = self.chunk_for(mem);
        match (self.cinuse(p), self.chunksize(p), self.overhead_for(p)) {
            (Ok(true), Ok(size), Ok(overhead)) => size - overhead,
            _ => 0,
        }
    }

    /// Visit every chunk in every segment, address order within segments.
    pub fn walk_chunks(
        &self,
        mut visit: impl FnMut(ChunkView),
    ) -> Result<(), HeapError> {
        for seg in &self.segments {
            self.walk_segment(seg, &mut visit)?;
        }
        Ok(())
    }

    fn walk_segment(
        &self,
        seg: &Segment,
        visit: &mut impl FnMut(ChunkView),
    ) -> Result<(), HeapError> {
        let mut q = seg.base;
        while q < seg.end() {
            if q == self.top {
                visit(ChunkView {
                    addr: q,
                    size: self.topsize,
                    in_use: false,
                    is_top: true,
                });
                break;
            }
            let head = self.head(q)?;
            let size = head & !INUSE_BITS;
            if size <= WORD {
                // Fencepost area (or the trailing zero word).
                break;
            }
            if size < MIN_CHUNK_SIZE || q + size > seg.end() {
                return Err(HeapError::Corruption {
                    addr: q,
                    what: "chunk size walks out of its segment",
                });
            }
            visit(ChunkView {
                addr: q,
                size,
                in_use: head & crate::chunk::CINUSE != 0,
                is_top: false,
            });
            q += size;
        }
        Ok(())
    }

    /// Verify the structural invariants of the whole heap. Intended for
    /// tests and diagnostics; cost is linear in live chunks.
    pub fn check_integrity(&self) -> Result<(), HeapError> {
        if self.footprint > self.max_footprint {
            return Err(HeapError::Corruption {
                addr: 0,
                what: "footprint exceeds its recorded peak",
            });
        }
        if self.top != NIL {
            if self.chunksize(self.top)? != self.topsize {
                return Err(HeapError::Corruption {
                    addr: self.top,
                    what: "top size cache disagrees with its header",
                });
            }
            if self.segment_holding(self.top).is_none() {
                return Err(HeapError::Corruption {
                    addr: self.top,
                    what: "top chunk outside all segments",
                });
            }
        }
        if self.dv != NIL && self.chunksize(self.dv)? != self.dvsize {
            return Err(HeapError::Corruption {
                addr: self.dv,
                what: "designated victim size cache disagrees",
            });
        }

        for seg in &self.segments {
            let mut prev_free = false;
            let mut first = true;
            let mut err = None;
            self.walk_segment(seg, &mut |c: ChunkView| {
                if err.is_some() {
                    return;
                }
                if c.addr & ALIGN_MASK != 0 {
                    err = Some((c.addr, "misaligned chunk"));
                } else if prev_free && !c.in_use {
                    err = Some((c.addr, "two adjacent free chunks"));
                } else if first && !c.is_top {
                    // The first chunk of a segment borders the arena edge.
                    match self.pinuse(c.addr) {
                        Ok(true) => {}
                        _ => err = Some((c.addr, "segment-first chunk lost its edge bit")),
                    }
                }
                first = false;
                prev_free = !c.in_use;
            })?;
            if let Some((addr, what)) = err {
                return Err(HeapError::Corruption { addr, what });
            }
        }

        // Every binned chunk's bookkeeping must agree with the walk.
        self.check_free_chunks()?;
        self.check_bin_maps()?;
        Ok(())
    }

    /// Free chunks (other than top and the victim) must sit in the correct
    /// bin and carry a valid foot.
    fn check_free_chunks(&self) -> Result<(), HeapError> {
        let mut free = Vec::new();
        self.walk_chunks(|c| {
            if !c.in_use && !c.is_top {
                free.push((c.addr, c.size));
            }
        })?;
        for (addr, size) in free {
            if self.prev_foot(addr + size)? != size {
                return Err(HeapError::Corruption {
                    addr,
                    what: "free chunk foot disagrees with its head",
                });
            }
            if self.pinuse(addr + size)? {
                return Err(HeapError::Corruption {
                    addr,
                    what: "successor claims a free predecessor is in use",
                });
            }
            if addr == self.dv {
                continue;
            }
            if !self.bin_find(addr, size)? {
                return Err(HeapError::Corruption {
                    addr,
                    what: "free chunk missing from its bin",
                });
            }
        }
        Ok(())
    }

    /// Occupancy bitmaps must match bin contents exactly.
    fn check_bin_maps(&self) -> Result<(), HeapError> {
        for idx in 0..self.smallbins.len() {
            let marked = self.smallmap_is_marked(idx);
            let populated = self.smallbins[idx] != NIL;
            if marked != populated {
                return Err(HeapError::Corruption {
                    addr: idx,
                    what: "small bitmap out of sync with its bin",
                });
            }
        }
        for idx in 0..self.treebins.len() {
            let marked = self.treemap_is_marked(idx);
            let populated = self.treebins[idx] != NIL;
            if marked != populated {
                return Err(HeapError::Corruption {
                    addr: idx,
                    what: "tree bitmap out of sync with its bin",
                });
            }
        }
        Ok(())
    }

    /// Locate a free chunk in its bin, following list rings and tree nodes.
    fn bin_find(&self, x: usize, size: usize) -> Result<bool, HeapError> {
        if is_small(size) {
            let head = self.smallbins[small_index(size)];
            if head == NIL {
                return Ok(false);
            }
            let mut q = head;
            loop {
                if q == x {
                    return Ok(true);
                }
                q = self.fd(q)?;
                if q == head {
                    return Ok(false);
                }
            }
        }
        let root = self.treebins[tree_index(size)];
        if root == NIL {
            return Ok(false);
        }
        let mut stack = vec![root];
        while let Some(t) = stack.pop() {
            let mut q = t;
            loop {
                if q == x {
                    return Ok(true);
                }
                q = self.fd(q)?;
                if q == t {
                    break;
                }
            }
            for side in 0..2 {
                let c = self.child(t, side)?;
                if c != NIL {
                    stack.push(c);
                }
            }
        }
        Ok(false)
    }

    /// Accounting snapshot derived from a full walk.
    pub fn stats(&self) -> Result<HeapStats, HeapError> {
        let arena_bytes: usize = self.segments.iter().map(|s| s.size).sum();
        let mapped_bytes = self.footprint - arena_bytes;
        let mut used_in_segments = 0;
        let mut free_bytes = 0;
        self.walk_chunks(|c| {
            if c.in_use {
                used_in_segments += c.size;
            } else {
                free_bytes += c.size;
            }
        })?;
        Ok(HeapStats {
            arena_bytes,
            mapped_bytes,
            peak_bytes: self.max_footprint,
            used_bytes: used_in_segments + mapped_bytes,
            free_bytes,
            trimmable_bytes: self.topsize,
        })
    }
}
