//! Resize, aligned allocation, and grouped allocation.
//!
//! Resizing prefers in-place outcomes: shrink by giving the tail back,
//! grow into an adjacent top chunk, or remap a direct mapping; only then
//! allocate-copy-free. Aligned allocation over-allocates and carves the
//! leading and trailing slack back into the bins. Grouped allocation cuts
//! one aggregate chunk into consecutively addressed, independently
//! freeable elements.

use crate::chunk::{
    ALIGNMENT, CINUSE, MAX_REQUEST, MIN_CHUNK_SIZE, NIL, PINUSE, WORD, request_to_chunk,
};
use crate::error::HeapError;
use crate::os::PageSource;

use super::Arena;

impl<S: PageSource> Arena<S> {
    /// Resize an allocation to at least `bytes`, preserving payload up to
    /// the smaller of the two sizes. `resize(0, n)` allocates;
    /// `resize(p, 0)` releases and returns `None`.
    pub fn resize(&mut self, mem: usize, bytes: usize) -> Option<usize> {
        if mem == 0 {
            return self.allocate(bytes);
        }
        if bytes == 0 {
            self.release(mem);
            return None;
        }
        let res = self.realloc_inner(mem, bytes);
        self.absorb(res)
    }

    fn realloc_inner(&mut self, mem: usize, bytes: usize) -> Result<usize, HeapError> {
        if bytes >= MAX_REQUEST {
            return Err(HeapError::AllocationFailed { requested: bytes });
        }
        if mem < crate::chunk::MEM_OFFSET {
            return Err(HeapError::UsageError {
                addr: mem,
                reason: "pointer below any possible chunk",
            });
        }
        let oldp = self.chunk_for(mem);
        if !self.ok_address(oldp) || !self.cinuse(oldp)? {
            return Err(HeapError::UsageError {
                addr: mem,
                reason: "resize of a pointer that is not a live allocation",
            });
        }
        let oldsize = self.chunksize(oldp)?;
        let next = oldp + oldsize;
        if oldp >= next || !self.pinuse(next)? {
            return Err(HeapError::UsageError {
                addr: mem,
                reason: "resize target has a damaged successor",
            });
        }
        self.check_footer(oldp)?;

        let nb = self.request_to_chunk(bytes)?;
        let mut newp = NIL;
        let mut extra = NIL;

        if self.is_direct(oldp)? {
            if let Some(np) = self.mmap_resize(oldp, nb)? {
                newp = np;
            }
        } else if oldsize >= nb {
            // Shrink in place; the tail becomes a freeable side allocation.
            let rsize = oldsize - nb;
            newp = oldp;
            if rsize >= MIN_CHUNK_SIZE {
                let remainder = oldp + nb;
                self.set_inuse(oldp, nb)?;
                self.set_inuse(remainder, rsize)?;
                extra = self.mem_for(remainder);
            }
        } else if next == self.top && oldsize + self.topsize > nb {
            // Grow into the adjacent top chunk.
            let newsize = oldsize + self.topsize;
            let newtopsize = newsize - nb;
            let newtop = oldp + nb;
            self.set_inuse(oldp, nb)?;
            self.set_head(newtop, newtopsize | PINUSE)?;
            self.top = newtop;
            self.topsize = newtopsize;
            newp = oldp;
        }

        if newp != NIL {
            if extra != NIL {
                self.free_inner(extra)?;
            }
            return Ok(self.mem_for(newp));
        }

        // Move: allocate, copy the overlapping payload, free the original.
        let newmem = self.alloc_inner(bytes)?;
        let old_usable = oldsize - self.overhead_for(oldp)?;
        self.space.copy(mem, newmem, old_usable.min(bytes))?;
        self.free_inner(mem)?;
        Ok(newmem)
    }

    /// Allocate `bytes` with the payload on an `alignment` boundary.
    /// Alignments below the default are served by the ordinary path;
    /// others are rounded up to a power of two.
    pub fn allocate_aligned(&mut self, alignment: usize, bytes: usize) -> Option<usize> {
        let res = self.memalign_inner(alignment, bytes);
        self.absorb(res)
    }

    /// Page-aligned allocation.
    pub fn allocate_page_aligned(&mut self, bytes: usize) -> Option<usize> {
        let page = self.source.page_size();
        self.allocate_aligned(page, bytes)
    }

    /// Page-aligned allocation rounded up to whole pages.
    pub fn allocate_whole_pages(&mut self, bytes: usize) -> Option<usize> {
        let page = self.source.page_size();
        let rounded = bytes.checked_add(page - 1)? & !(page - 1);
        self.allocate_aligned(page, rounded)
    }

    fn memalign_inner(&mut self, alignment: usize, bytes: usize) -> Result<usize, HeapError> {
        if alignment <= ALIGNMENT {
            return self.alloc_inner(bytes);
        }
        let mut alignment = alignment.max(MIN_CHUNK_SIZE);
        if !alignment.is_power_of_two() {
            alignment = alignment.next_power_of_two();
        }
        if bytes >= MAX_REQUEST - alignment {
            return Err(HeapError::AllocationFailed { requested: bytes });
        }

        // Over-allocate so an aligned spot with room for a leading carve
        // always exists inside the chunk.
        let nb = self.request_to_chunk(bytes)?;
        let req = nb + alignment + MIN_CHUNK_SIZE - self.chunk_overhead();
        let mem = self.alloc_inner(req)?;
        let mut p = self.chunk_for(mem);
        let mut leader = NIL;
        let mut trailer = NIL;

        if mem % alignment != 0 {
            // First aligned payload position with at least a minimal chunk
            // of lead; the over-allocation guarantees it fits.
            let aligned_mem = (mem + alignment - 1) & !(alignment - 1);
            let br = self.chunk_for(aligned_mem);
            let pos = if br - p >= MIN_CHUNK_SIZE {
                br
            } else {
                br + alignment
            };
            let leadsize = pos - p;
            let newsize = self.chunksize(p)? - leadsize;

            if self.is_direct(p)? {
                // Direct chunks just slide their map offset.
                let pf = self.prev_foot(p)?;
                self.set_prev_foot(pos, pf + leadsize)?;
                self.set_head(pos, newsize | CINUSE)?;
            } else {
                self.set_inuse(pos, newsize)?;
                self.set_inuse(p, leadsize)?;
                leader = self.mem_for(p);
            }
            p = pos;
        }

        // Give back slack beyond the request.
        if !self.is_direct(p)? {
            let size = self.chunksize(p)?;
            if size > nb + MIN_CHUNK_SIZE {
                let rsize = size - nb;
                let remainder = p + nb;
                self.set_inuse(p, nb)?;
                self.set_inuse(remainder, rsize)?;
                trailer = self.mem_for(remainder);
            }
        }

        debug_assert!(self.chunksize(p)? >= nb);
        debug_assert_eq!(self.mem_for(p) % alignment, 0);
        if leader != NIL {
            self.free_inner(leader)?;
        }
        if trailer != NIL {
            self.free_inner(trailer)?;
        }
        Ok(self.mem_for(p))
    }

    /// Allocate `n` zero-filled elements of `elem_size` bytes as one carve:
    /// consecutive addresses, each independently freeable.
    pub fn allocate_grouped_zeroed(&mut self, n: usize, elem_size: usize) -> Option<Vec<usize>> {
        let sizes = [elem_size];
        let res = self.ialloc(n, &sizes, true, true);
        self.absorb(res)
    }

    /// Grouped allocation with per-element sizes, not zeroed.
    pub fn allocate_grouped_varying(&mut self, sizes: &[usize]) -> Option<Vec<usize>> {
        let res = self.ialloc(sizes.len(), sizes, false, false);
        self.absorb(res)
    }

    fn ialloc(
        &mut self,
        n: usize,
        sizes: &[usize],
        uniform: bool,
        zero: bool,
    ) -> Result<Vec<usize>, HeapError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let overhead = self.chunk_overhead();
        let element_size = if uniform {
            request_to_chunk(sizes[0], overhead)
        } else {
            debug_assert_eq!(sizes.len(), n);
            0
        };
        let mut contents = 0usize;
        if uniform {
            contents = element_size
                .checked_mul(n)
                .ok_or(HeapError::AllocationFailed { requested: usize::MAX })?;
        } else {
            for &s in sizes {
                contents = contents
                    .checked_add(request_to_chunk(s, overhead))
                    .ok_or(HeapError::AllocationFailed { requested: usize::MAX })?;
            }
        }

        // The aggregate must stay bin-serviced: elements inside a dedicated
        // mapping could never be freed one by one.
        let was_enabled = self.map_enabled;
        self.map_enabled = false;
        let res = self.alloc_inner(contents - overhead);
        self.map_enabled = was_enabled;
        let mem = res?;

        let p = self.chunk_for(mem);
        let mut remainder = self.chunksize(p)?;
        debug_assert!(!self.is_direct(p)?);

        if zero {
            // The whole payload span, element headers excluded later.
            self.space.fill(mem, remainder - WORD, 0)?;
        }

        let mut out = Vec::with_capacity(n);
        let mut q = p;
        for i in 0..n {
            out.push(self.mem_for(q));
            if i != n - 1 {
                let size = if uniform {
                    element_size
                } else {
                    request_to_chunk(sizes[i], overhead)
                };
                remainder -= size;
                self.set_size_and_pinuse_of_inuse_chunk(q, size)?;
                q += size;
            } else {
                // The final element absorbs any over-allocation slop.
                self.set_size_and_pinuse_of_inuse_chunk(q, remainder)?;
            }
        }
        Ok(out)
    }
}
