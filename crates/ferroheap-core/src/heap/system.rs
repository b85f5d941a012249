//! System allocation and release.
//!
//! Growing the arena tries, in order: contiguous extension of the break, a
//! fresh independent mapping, and a last-resort extension once the
//! contiguous latch has tripped. New space is merged with an adjacent
//! segment when policy-compatible, otherwise registered as a new segment
//! behind trailing fenceposts. Requests at or above the direct-map
//! threshold bypass all of that and get a dedicated mapping tagged for
//! single-unmap release.

use crate::chunk::{
    ALIGN_MASK, CINUSE, FENCEPOST_HEAD, MAPPED_TAG, MAX_REQUEST, MIN_CHUNK_SIZE, MMAP_FOOT_PAD,
    NIL, TOP_FOOT_SIZE, WORD, is_small,
};
use crate::error::HeapError;
use crate::os::PageSource;
use crate::trace::EventLevel;

use super::{Arena, Segment, SegmentKind};

impl<S: PageSource> Arena<S> {
    /// Get memory from the system to satisfy a request of `nb` chunk bytes,
    /// then allocate from the (new or extended) top.
    pub(crate) fn sys_alloc(&mut self, nb: usize) -> Result<usize, HeapError> {
        // Directly map large requests; bin state is never involved.
        if self.map_enabled && nb >= self.options.map_threshold && self.topsize != 0 {
            if let Some(mem) = self.mmap_alloc(nb)? {
                return Ok(mem);
            }
        }

        let mut tbase = NIL;
        let mut tsize = 0usize;
        let mut kind = SegmentKind::Contiguous;

        if !self.contiguous_failed {
            // Ask only for what top cannot already cover.
            let shortfall = nb - self.topsize.min(nb);
            let mut asize = self
                .options
                .granularity_align(shortfall + TOP_FOOT_SIZE + 1);
            if asize < MAX_REQUEST {
                match self.source.grow(&mut self.space, asize) {
                    Ok(base) => {
                        let adjacent_to_top = self
                            .segment_holding(self.top)
                            .map(|i| self.segments[i].end() == base)
                            .unwrap_or(self.top == NIL);
                        if adjacent_to_top || asize >= nb + TOP_FOOT_SIZE + 1 {
                            tbase = base;
                            tsize = asize;
                        } else {
                            // The break grew somewhere unrelated to top and is
                            // too small to stand alone; extend it or give it
                            // back and stop trying the contiguous path.
                            let esize = self
                                .options
                                .granularity_align(nb + TOP_FOOT_SIZE + 1 - asize);
                            if self.source.grow(&mut self.space, esize).is_ok() {
                                asize += esize;
                                tbase = base;
                                tsize = asize;
                            } else {
                                let _ = self.source.shrink(&mut self.space, asize);
                                self.contiguous_failed = true;
                            }
                        }
                    }
                    Err(_) => self.contiguous_failed = true,
                }
            }
        }

        if tbase == NIL {
            let rsize = self.options.granularity_align(nb + TOP_FOOT_SIZE + 1);
            if rsize > nb {
                if let Ok(base) = self.source.map(&mut self.space, rsize) {
                    tbase = base;
                    tsize = rsize;
                    kind = SegmentKind::Mapped;
                }
            }
        }

        // Last resort: a non-contiguous break extension after mapping failed.
        if tbase == NIL && self.contiguous_failed {
            let asize = self.options.granularity_align(nb + TOP_FOOT_SIZE + 1);
            if asize < MAX_REQUEST {
                if let Ok(base) = self.source.grow(&mut self.space, asize) {
                    tbase = base;
                    tsize = asize;
                    kind = SegmentKind::Contiguous;
                }
            }
        }

        if tbase == NIL {
            return Err(HeapError::AllocationFailed { requested: nb });
        }

        self.bump_footprint(tsize);
        self.least_addr = self.least_addr.min(tbase);
        self.record_event(EventLevel::Info, "segment_grow", Some(tbase), Some(tsize));

        if self.top == NIL {
            self.segments.push(Segment {
                base: tbase,
                size: tsize,
                kind,
            });
            self.init_top(tbase, tsize - TOP_FOOT_SIZE)?;
        } else {
            let top = self.top;
            let append = self
                .segments
                .iter()
                .position(|s| s.end() == tbase && s.kind == kind && s.holds(top));
            if let Some(i) = append {
                if kind == SegmentKind::Mapped {
                    self.space.coalesce(self.segments[i].base, tbase)?;
                }
                self.segments[i].size += tsize;
                let topsize = self.topsize;
                self.init_top(top, topsize + tsize)?;
            } else {
                let prepend = self
                    .segments
                    .iter()
                    .position(|s| s.base == tbase + tsize && s.kind == kind);
                if let Some(i) = prepend {
                    if kind == SegmentKind::Mapped {
                        self.space.coalesce(tbase, self.segments[i].base)?;
                    }
                    let oldbase = self.segments[i].base;
                    self.segments[i].base = tbase;
                    self.segments[i].size += tsize;
                    return self.prepend_alloc(tbase, oldbase, nb);
                }
                self.add_segment(tbase, tsize, kind)?;
            }
        }

        if nb < self.topsize {
            let p = self.split_top(nb)?;
            return Ok(self.mem_for(p));
        }
        Err(HeapError::AllocationFailed { requested: nb })
    }

    /// Dedicated mapping for one oversized chunk. Its map offset and tag go
    /// in `prev_foot` so release can reconstruct the unmap arguments.
    pub(crate) fn mmap_alloc(&mut self, nb: usize) -> Result<Option<usize>, HeapError> {
        let mmsize = self
            .options
            .granularity_align(nb + 6 * WORD + ALIGN_MASK);
        if mmsize <= nb {
            return Ok(None);
        }
        let Ok(mm) = self.source.map(&mut self.space, mmsize) else {
            return Ok(None);
        };
        // Mapping bases are page-aligned, so the payload is already aligned
        // and the chunk sits at the region base.
        let offset = 0;
        let psize = mmsize - offset - MMAP_FOOT_PAD;
        let p = mm + offset;
        self.set_prev_foot(p, offset | MAPPED_TAG)?;
        self.set_head(p, psize | CINUSE)?;
        self.mark_inuse_footer(p, psize)?;
        self.set_head(p + psize, FENCEPOST_HEAD)?;
        self.set_head(p + psize + WORD, 0)?;
        self.least_addr = self.least_addr.min(mm);
        self.bump_footprint(mmsize);
        self.record_event(EventLevel::Info, "direct_map", Some(p), Some(psize));
        Ok(Some(self.mem_for(p)))
    }

    /// Resize a directly mapped chunk, in place when the mapping allows it.
    pub(crate) fn mmap_resize(
        &mut self,
        oldp: usize,
        nb: usize,
    ) -> Result<Option<usize>, HeapError> {
        let oldsize = self.chunksize(oldp)?;
        // Direct regions never shrink below the bin-serviced range.
        if is_small(nb) {
            return Ok(None);
        }
        // Keep the old chunk if it is big enough but not wastefully so.
        if oldsize >= nb + WORD && (oldsize - nb) <= (self.options.granularity << 1) {
            return Ok(Some(oldp));
        }
        let offset = self.prev_foot(oldp)? & !MAPPED_TAG;
        let oldmmsize = oldsize + offset + MMAP_FOOT_PAD;
        let newmmsize = self
            .options
            .granularity_align(nb + 6 * WORD + ALIGN_MASK);
        let Ok(cp) = self
            .source
            .remap(&mut self.space, oldp - offset, oldmmsize, newmmsize, true)
        else {
            return Ok(None);
        };
        let newp = cp + offset;
        let psize = newmmsize - offset - MMAP_FOOT_PAD;
        self.set_head(newp, psize | CINUSE)?;
        self.mark_inuse_footer(newp, psize)?;
        self.set_head(newp + psize, FENCEPOST_HEAD)?;
        self.set_head(newp + psize + WORD, 0)?;
        self.least_addr = self.least_addr.min(cp);
        if newmmsize >= oldmmsize {
            self.bump_footprint(newmmsize - oldmmsize);
        } else {
            self.footprint -= oldmmsize - newmmsize;
        }
        self.record_event(EventLevel::Info, "direct_remap", Some(newp), Some(psize));
        Ok(Some(newp))
    }

    /// Allocate from freshly prepended space, consolidating the remainder
    /// with the first chunk of the old segment base.
    pub(crate) fn prepend_alloc(
        &mut self,
        newbase: usize,
        oldbase: usize,
        nb: usize,
    ) -> Result<usize, HeapError> {
        let p = newbase;
        let oldfirst = oldbase;
        let psize = oldbase - newbase;
        let q = p + nb;
        let mut qsize = psize - nb;
        self.set_size_and_pinuse_of_inuse_chunk(p, nb)?;

        debug_assert!(oldfirst > q);
        debug_assert!(self.pinuse(oldfirst)?);
        debug_assert!(qsize >= MIN_CHUNK_SIZE);

        if oldfirst == self.top {
            self.topsize += qsize;
            let tsize = self.topsize;
            self.top = q;
            self.set_head(q, tsize | crate::chunk::PINUSE)?;
        } else if oldfirst == self.dv {
            self.dvsize += qsize;
            let dsize = self.dvsize;
            self.dv = q;
            self.set_size_and_pinuse_of_free_chunk(q, dsize)?;
        } else {
            let mut oldfirst = oldfirst;
            if !self.cinuse(oldfirst)? {
                let nsize = self.chunksize(oldfirst)?;
                self.unlink_chunk(oldfirst, nsize)?;
                oldfirst += nsize;
                qsize += nsize;
            }
            self.set_free_with_pinuse(q, qsize, oldfirst)?;
            self.insert_chunk(q, qsize)?;
        }

        Ok(self.mem_for(p))
    }

    /// Register a new non-adjacent segment: move top into it and wall off
    /// the old top with fenceposts, binning whatever is left of it.
    pub(crate) fn add_segment(
        &mut self,
        tbase: usize,
        tsize: usize,
        kind: SegmentKind,
    ) -> Result<(), HeapError> {
        let old_top = self.top;
        let old_seg = self
            .segment_holding(old_top)
            .ok_or(HeapError::Corruption {
                addr: old_top,
                what: "top chunk outside all segments",
            })?;
        let old_end = self.segments[old_seg].end();

        // Fence area: an aligned spot near the old end, but never closer to
        // the old top than one minimal chunk.
        let raw = (old_end - TOP_FOOT_SIZE) & !ALIGN_MASK;
        let csp = if raw < old_top + MIN_CHUNK_SIZE {
            old_top
        } else {
            raw
        };

        self.segments.push(Segment {
            base: tbase,
            size: tsize,
            kind,
        });
        self.init_top(tbase, tsize - TOP_FOOT_SIZE)?;

        // Trailing fenceposts across the reserved tail of the old segment.
        let mut fence = csp;
        let mut nfences = 0;
        while fence + 2 * WORD <= old_end {
            self.set_head(fence, FENCEPOST_HEAD)?;
            fence += WORD;
            nfences += 1;
        }
        debug_assert!(nfences >= 2);

        // Whatever is left of the old top becomes an ordinary free chunk.
        if csp != old_top {
            let psize = csp - old_top;
            self.set_free_with_pinuse(old_top, psize, csp)?;
            self.insert_chunk(old_top, psize)?;
        }

        Ok(())
    }

    // ---- release ------------------------------------------------------------

    /// Unmap every independent segment that has collapsed into a single
    /// free chunk. Returns bytes released.
    pub(crate) fn release_unused_segments(&mut self) -> Result<usize, HeapError> {
        let mut released = 0;
        let mut i = 0;
        while i < self.segments.len() {
            let seg = self.segments[i];
            if seg.kind == SegmentKind::Mapped && !seg.holds(self.top) {
                let p = seg.base;
                let psize = self.chunksize(p)?;
                if !self.cinuse(p)? && p + psize >= seg.end() - TOP_FOOT_SIZE {
                    if p == self.dv {
                        self.dv = NIL;
                        self.dvsize = 0;
                    } else {
                        self.unlink_large_chunk(p)?;
                    }
                    if self
                        .source
                        .unmap(&mut self.space, seg.base, seg.size)
                        .is_ok()
                    {
                        released += seg.size;
                        self.footprint -= seg.size;
                        self.segments.remove(i);
                        self.record_event(
                            EventLevel::Info,
                            "segment_release",
                            Some(seg.base),
                            Some(seg.size),
                        );
                        continue;
                    }
                    // Could not unmap after all: put the chunk back.
                    self.insert_large_chunk(p, psize)?;
                }
            }
            i += 1;
        }
        Ok(released)
    }

    /// Give unused top space back to the system in whole granularity units,
    /// keeping at least `pad` bytes of slack. Latches off after a failed
    /// attempt so unreleasable heaps do not retry on every free.
    pub(crate) fn sys_trim(&mut self, pad: usize) -> Result<usize, HeapError> {
        let mut released = 0;
        if pad < MAX_REQUEST && self.top != NIL {
            let pad = pad + TOP_FOOT_SIZE;
            if self.topsize > pad {
                // Whole units only, always keeping one.
                let unit = self.options.granularity;
                let extra = ((self.topsize - pad + unit - 1) / unit - 1) * unit;
                if extra > 0 {
                    if let Some(i) = self.segment_holding(self.top) {
                        let seg = self.segments[i];
                        match seg.kind {
                            SegmentKind::Extern => {}
                            SegmentKind::Mapped => {
                                if seg.size >= extra {
                                    let newsize = seg.size - extra;
                                    let shrunk = self
                                        .source
                                        .remap(&mut self.space, seg.base, seg.size, newsize, false)
                                        .is_ok()
                                        || self
                                            .source
                                            .unmap(&mut self.space, seg.base + newsize, extra)
                                            .is_ok();
                                    if shrunk {
                                        released = extra;
                                    }
                                }
                            }
                            SegmentKind::Contiguous => {
                                if let Ok(n) = self.source.shrink(&mut self.space, extra) {
                                    released = n;
                                }
                            }
                        }
                        if released != 0 {
                            self.segments[i].size -= released;
                            self.footprint -= released;
                            let top = self.top;
                            let topsize = self.topsize;
                            self.init_top(top, topsize - released)?;
                            self.record_event(
                                EventLevel::Info,
                                "trim",
                                Some(top),
                                Some(released),
                            );
                        }
                    }
                }
            }

            released += self.release_unused_segments()?;

            if released == 0 {
                self.trim_check = usize::MAX;
            }
        }
        Ok(released)
    }

    /// Release top slack beyond `pad` back to the system. Returns whether
    /// anything was released.
    pub fn trim(&mut self, pad: usize) -> bool {
        let res = self.sys_trim(pad);
        self.absorb(res).map(|n| n != 0).unwrap_or(false)
    }

    // ---- arena lifecycle -------------------------------------------------------

    /// Map an initial segment of at least `capacity` usable bytes. Instance
    /// heaps grow by independent mappings only, so the contiguous path is
    /// latched off.
    pub(crate) fn prime(&mut self, capacity: usize) -> Result<(), HeapError> {
        debug_assert!(self.segments.is_empty());
        let rs = if capacity == 0 {
            self.options.granularity
        } else {
            capacity
                .checked_add(TOP_FOOT_SIZE + MIN_CHUNK_SIZE)
                .ok_or(HeapError::AllocationFailed { requested: capacity })?
        };
        if rs >= MAX_REQUEST {
            return Err(HeapError::AllocationFailed { requested: capacity });
        }
        let tsize = self.options.granularity_align(rs);
        let tbase = self.source.map(&mut self.space, tsize)?;
        self.contiguous_failed = true;
        self.bump_footprint(tsize);
        self.least_addr = self.least_addr.min(tbase);
        self.segments.push(Segment {
            base: tbase,
            size: tsize,
            kind: SegmentKind::Mapped,
        });
        self.init_top(tbase, tsize - TOP_FOOT_SIZE)?;
        self.record_event(EventLevel::Info, "segment_grow", Some(tbase), Some(tsize));
        Ok(())
    }

    /// Build the arena over caller-supplied space. The segment is marked
    /// external and is never merged, trimmed, or released.
    pub(crate) fn adopt_region(&mut self, base: usize, capacity: usize) -> Result<(), HeapError> {
        if base == 0 || base & ALIGN_MASK != 0 {
            return Err(HeapError::UsageError {
                addr: base,
                reason: "region base must be aligned and nonzero",
            });
        }
        if capacity < MIN_CHUNK_SIZE + TOP_FOOT_SIZE || capacity & ALIGN_MASK != 0 {
            return Err(HeapError::UsageError {
                addr: base,
                reason: "region too small for a heap",
            });
        }
        self.space.insert_region(base, capacity)?;
        self.contiguous_failed = true;
        self.bump_footprint(capacity);
        self.least_addr = self.least_addr.min(base);
        self.segments.push(Segment {
            base,
            size: capacity,
            kind: SegmentKind::Extern,
        });
        self.init_top(base, capacity - TOP_FOOT_SIZE)?;
        Ok(())
    }

    /// Release every owned segment back to the system and poison the arena.
    /// Returns bytes released. External segments are left alone.
    pub fn destroy(&mut self) -> usize {
        let mut freed = 0;
        let segments = std::mem::take(&mut self.segments);
        for seg in segments {
            match seg.kind {
                SegmentKind::Mapped => {
                    if self
                        .source
                        .unmap(&mut self.space, seg.base, seg.size)
                        .is_ok()
                    {
                        freed += seg.size;
                        self.footprint -= seg.size;
                    }
                }
                SegmentKind::Contiguous => {
                    if let Ok(n) = self.source.shrink(&mut self.space, seg.size) {
                        freed += n;
                        self.footprint -= n;
                    }
                }
                SegmentKind::Extern => {}
            }
        }
        self.smallmap = 0;
        self.treemap = 0;
        self.smallbins = [NIL; crate::chunk::NSMALLBINS];
        self.treebins = [NIL; crate::chunk::NTREEBINS];
        self.dv = NIL;
        self.dvsize = 0;
        self.top = NIL;
        self.topsize = 0;
        self.magic = 0;
        self.record_event(EventLevel::Info, "destroy", None, Some(freed));
        freed
    }

    /// Footer tag for in-use chunks, shared with the direct-map path.
    fn mark_inuse_footer(&mut self, p: usize, size: usize) -> Result<(), HeapError> {
        if self.options.footers {
            let magic = self.magic;
            self.set_prev_foot(p + size, magic)?;
        }
        Ok(())
    }
}
