//! Page sources: the arena's view of the operating system.
//!
//! All platform variance in the original design (sbrk, mmap, remap) sits
//! behind one trait. A source only decides placement and accounting; the
//! bytes themselves live in the arena's [`AddressSpace`]. Two strategies
//! are provided, contiguous extension and independent mappings, plus their
//! composition, which is what a default heap runs on.

use thiserror::Error;

use crate::mem::AddressSpace;

/// Default page size of the simulated system.
pub const PAGE_SIZE: usize = 4096;

/// Where the contiguous break region starts.
const BRK_BASE: usize = 0x0000_0010_0000;

/// Where independent mappings start. Far above any plausible break so the
/// two strategies never collide.
const MAP_BASE: usize = 0x0000_8000_0000;

/// Failure from the page source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SystemFailure {
    /// The source cannot perform this operation at all.
    #[error("operation not supported by this page source")]
    Unsupported,
    /// Address space (or the configured quota) is exhausted.
    #[error("out of address space")]
    OutOfSpace,
    /// The given span does not match a live mapping.
    #[error("bad span {base:#x}+{len:#x}")]
    BadSpan { base: usize, len: usize },
}

/// Operating-system boundary used by an arena.
///
/// `grow`/`shrink` model a contiguous morecore-style break; `map`/`unmap`/
/// `remap` model independent anonymous mappings. A source that lacks a
/// strategy reports [`SystemFailure::Unsupported`] and the arena falls back
/// per its acquisition order.
pub trait PageSource {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Extend the break by `len` bytes; returns the base of the new span
    /// (the old break end).
    fn grow(&mut self, space: &mut AddressSpace, len: usize) -> Result<usize, SystemFailure>;

    /// Release `len` bytes from the break tail; returns bytes released.
    fn shrink(&mut self, space: &mut AddressSpace, len: usize) -> Result<usize, SystemFailure>;

    /// Map a fresh independent span of `len` bytes; returns its base.
    fn map(&mut self, space: &mut AddressSpace, len: usize) -> Result<usize, SystemFailure>;

    /// Unmap `[base, base + len)`, which must be a whole mapping or its tail.
    fn unmap(
        &mut self,
        space: &mut AddressSpace,
        base: usize,
        len: usize,
    ) -> Result<(), SystemFailure>;

    /// Resize the mapping at `base` from `old_len` to `new_len`, in place if
    /// possible, moving only when `can_move` is set. Returns the new base.
    fn remap(
        &mut self,
        space: &mut AddressSpace,
        base: usize,
        old_len: usize,
        new_len: usize,
        can_move: bool,
    ) -> Result<usize, SystemFailure>;
}

/// Morecore-style source: one break region that only grows and shrinks at
/// its tail. Mapping operations are unsupported.
pub struct ContiguousMemory {
    base: usize,
    end: usize,
    quota: usize,
}

impl ContiguousMemory {
    pub fn new() -> Self {
        Self::with_quota(usize::MAX / 4)
    }

    /// Cap the break at `quota` total bytes; growth past it fails, which is
    /// how tests exercise the allocator's out-of-space paths.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            base: BRK_BASE,
            end: BRK_BASE,
            quota,
        }
    }

    pub fn set_quota(&mut self, quota: usize) {
        self.quota = quota;
    }

    fn used(&self) -> usize {
        self.end - self.base
    }
}

impl Default for ContiguousMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for ContiguousMemory {
    fn grow(&mut self, space: &mut AddressSpace, len: usize) -> Result<usize, SystemFailure> {
        if len == 0 || self.used().checked_add(len).is_none_or(|u| u > self.quota) {
            return Err(SystemFailure::OutOfSpace);
        }
        let old_end = self.end;
        if old_end == self.base {
            space
                .insert_region(self.base, len)
                .map_err(|_| SystemFailure::OutOfSpace)?;
        } else {
            space
                .extend_region(self.base, len)
                .map_err(|_| SystemFailure::OutOfSpace)?;
        }
        self.end = old_end + len;
        Ok(old_end)
    }

    fn shrink(&mut self, space: &mut AddressSpace, len: usize) -> Result<usize, SystemFailure> {
        if len == 0 || len > self.used() {
            return Err(SystemFailure::BadSpan { base: self.end, len });
        }
        let keep = self.used() - len;
        if keep == 0 {
            space
                .remove_region(self.base)
                .map_err(|_| SystemFailure::BadSpan { base: self.base, len })?;
        } else {
            space
                .shrink_region(self.base, keep)
                .map_err(|_| SystemFailure::BadSpan { base: self.base, len })?;
        }
        self.end -= len;
        Ok(len)
    }

    fn map(&mut self, _: &mut AddressSpace, _: usize) -> Result<usize, SystemFailure> {
        Err(SystemFailure::Unsupported)
    }

    fn unmap(&mut self, _: &mut AddressSpace, _: usize, _: usize) -> Result<(), SystemFailure> {
        Err(SystemFailure::Unsupported)
    }

    fn remap(
        &mut self,
        _: &mut AddressSpace,
        _: usize,
        _: usize,
        _: usize,
        _: bool,
    ) -> Result<usize, SystemFailure> {
        Err(SystemFailure::Unsupported)
    }
}

/// Mmap-style source: independent spans handed out from a rising cursor,
/// separated by a one-page guard gap, with unmapped holes reused first-fit.
/// Break operations are unsupported.
pub struct MappedMemory {
    cursor: usize,
    mapped: usize,
    quota: usize,
    /// Released address ranges available for reuse, sorted by base.
    holes: Vec<(usize, usize)>,
}

impl MappedMemory {
    pub fn new() -> Self {
        Self::with_quota(usize::MAX / 4)
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            cursor: MAP_BASE,
            mapped: 0,
            quota,
            holes: Vec::new(),
        }
    }

    pub fn set_quota(&mut self, quota: usize) {
        self.quota = quota;
    }

    /// Bytes currently mapped through this source.
    pub fn mapped(&self) -> usize {
        self.mapped
    }

    /// Lowest hole that can fit `len` bytes.
    fn take_hole(&mut self, len: usize) -> Option<usize> {
        let idx = self.holes.iter().position(|&(_, hlen)| hlen >= len)?;
        let (base, hlen) = self.holes[idx];
        if hlen == len {
            self.holes.remove(idx);
        } else {
            self.holes[idx] = (base + len, hlen - len);
        }
        Some(base)
    }

    fn hole_overlaps(&self, lo: usize, hi: usize) -> bool {
        self.holes
            .iter()
            .any(|&(base, len)| base < hi && lo < base + len)
    }

    fn add_hole(&mut self, base: usize, len: usize) {
        let at = self
            .holes
            .iter()
            .position(|&(b, _)| b > base)
            .unwrap_or(self.holes.len());
        self.holes.insert(at, (base, len));
        // Fuse with neighbors so released spans stay reusable as wholes.
        if at + 1 < self.holes.len() && self.holes[at].0 + self.holes[at].1 == self.holes[at + 1].0
        {
            self.holes[at].1 += self.holes[at + 1].1;
            self.holes.remove(at + 1);
        }
        if at > 0 && self.holes[at - 1].0 + self.holes[at - 1].1 == self.holes[at].0 {
            self.holes[at - 1].1 += self.holes[at].1;
            self.holes.remove(at);
        }
    }
}

impl Default for MappedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for MappedMemory {
    fn grow(&mut self, _: &mut AddressSpace, _: usize) -> Result<usize, SystemFailure> {
        Err(SystemFailure::Unsupported)
    }

    fn shrink(&mut self, _: &mut AddressSpace, _: usize) -> Result<usize, SystemFailure> {
        Err(SystemFailure::Unsupported)
    }

    fn map(&mut self, space: &mut AddressSpace, len: usize) -> Result<usize, SystemFailure> {
        if len == 0 || self.mapped.checked_add(len).is_none_or(|m| m > self.quota) {
            return Err(SystemFailure::OutOfSpace);
        }
        let base = match self.take_hole(len) {
            Some(base) => base,
            None => {
                let base = self.cursor;
                // Guard gap keeps fresh mappings non-adjacent.
                self.cursor = base
                    .checked_add(len)
                    .and_then(|c| c.checked_add(PAGE_SIZE))
                    .ok_or(SystemFailure::OutOfSpace)?;
                base
            }
        };
        space
            .insert_region(base, len)
            .map_err(|_| SystemFailure::OutOfSpace)?;
        self.mapped += len;
        Ok(base)
    }

    fn unmap(
        &mut self,
        space: &mut AddressSpace,
        base: usize,
        len: usize,
    ) -> Result<(), SystemFailure> {
        match space.region_containing(base) {
            Some((rbase, rsize)) if rbase == base && rsize == len => {
                space
                    .remove_region(base)
                    .map_err(|_| SystemFailure::BadSpan { base, len })?;
            }
            // Tail release of a larger mapping.
            Some((rbase, rsize)) if rbase + rsize == base + len && base > rbase => {
                space
                    .shrink_region(rbase, base - rbase)
                    .map_err(|_| SystemFailure::BadSpan { base, len })?;
            }
            _ => return Err(SystemFailure::BadSpan { base, len }),
        }
        self.mapped -= len;
        self.add_hole(base, len);
        Ok(())
    }

    fn remap(
        &mut self,
        space: &mut AddressSpace,
        base: usize,
        old_len: usize,
        new_len: usize,
        can_move: bool,
    ) -> Result<usize, SystemFailure> {
        match space.region_containing(base) {
            Some((rbase, rsize)) if rbase == base && rsize == old_len => {}
            _ => return Err(SystemFailure::BadSpan { base, len: old_len }),
        }
        if new_len == old_len {
            return Ok(base);
        }
        if new_len < old_len {
            space
                .shrink_region(base, new_len)
                .map_err(|_| SystemFailure::BadSpan { base, len: new_len })?;
            self.mapped -= old_len - new_len;
            self.add_hole(base + new_len, old_len - new_len);
            return Ok(base);
        }
        let extra = new_len - old_len;
        if self.mapped.checked_add(extra).is_none_or(|m| m > self.quota) {
            return Err(SystemFailure::OutOfSpace);
        }
        if !self.hole_overlaps(base + old_len, base + new_len)
            && space.extend_region(base, extra).is_ok()
        {
            self.mapped += extra;
            if base + new_len >= self.cursor {
                self.cursor = base + new_len + PAGE_SIZE;
            }
            return Ok(base);
        }
        if !can_move {
            return Err(SystemFailure::OutOfSpace);
        }
        // Move: fresh mapping, contents carried over, old span released.
        let new_base = self.map(space, new_len)?;
        space
            .copy(base, new_base, old_len)
            .map_err(|_| SystemFailure::BadSpan { base, len: old_len })?;
        self.unmap(space, base, old_len)?;
        Ok(new_base)
    }
}

/// The default system: a break region for ordinary growth plus independent
/// mappings for large or non-contiguous acquisitions, mirroring the
/// original's morecore-and-mmap configuration.
#[derive(Default)]
pub struct SystemMemory {
    brk: ContiguousMemory,
    mm: MappedMemory,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap both strategies; used by tests to force exhaustion.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            brk: ContiguousMemory::with_quota(quota),
            mm: MappedMemory::with_quota(quota),
        }
    }

    pub fn set_quota(&mut self, quota: usize) {
        self.brk.set_quota(quota);
        self.mm.set_quota(quota);
    }
}

impl PageSource for SystemMemory {
    fn grow(&mut self, space: &mut AddressSpace, len: usize) -> Result<usize, SystemFailure> {
        self.brk.grow(space, len)
    }

    fn shrink(&mut self, space: &mut AddressSpace, len: usize) -> Result<usize, SystemFailure> {
        self.brk.shrink(space, len)
    }

    fn map(&mut self, space: &mut AddressSpace, len: usize) -> Result<usize, SystemFailure> {
        self.mm.map(space, len)
    }

    fn unmap(
        &mut self,
        space: &mut AddressSpace,
        base: usize,
        len: usize,
    ) -> Result<(), SystemFailure> {
        self.mm.unmap(space, base, len)
    }

    fn remap(
        &mut self,
        space: &mut AddressSpace,
        base: usize,
        old_len: usize,
        new_len: usize,
        can_move: bool,
    ) -> Result<usize, SystemFailure> {
        self.mm.remap(space, base, old_len, new_len, can_move)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_grow_is_adjacent() {
        let mut space = AddressSpace::new();
        let mut src = ContiguousMemory::new();
        let a = src.grow(&mut space, 0x1000).expect("first grow");
        let b = src.grow(&mut space, 0x1000).expect("second grow");
        assert_eq!(b, a + 0x1000, "break must extend in place");
        assert!(space.contains(a) && space.contains(b + 0xFFF));
        assert_eq!(src.shrink(&mut space, 0x1000).expect("shrink"), 0x1000);
        assert!(!space.contains(b));
    }

    #[test]
    fn contiguous_rejects_map_ops() {
        let mut space = AddressSpace::new();
        let mut src = ContiguousMemory::new();
        assert_eq!(
            src.map(&mut space, 0x1000),
            Err(SystemFailure::Unsupported)
        );
    }

    #[test]
    fn quota_exhaustion() {
        let mut space = AddressSpace::new();
        let mut src = ContiguousMemory::with_quota(0x2000);
        src.grow(&mut space, 0x2000).expect("within quota");
        assert_eq!(
            src.grow(&mut space, 0x1000),
            Err(SystemFailure::OutOfSpace)
        );
    }

    #[test]
    fn mapped_spans_and_tail_release() {
        let mut space = AddressSpace::new();
        let mut src = MappedMemory::new();
        let a = src.map(&mut space, 0x4000).expect("map a");
        let b = src.map(&mut space, 0x2000).expect("map b");
        assert_eq!(b, a + 0x4000 + PAGE_SIZE, "mappings are guard-separated");

        src.unmap(&mut space, a + 0x2000, 0x2000).expect("tail unmap");
        assert!(space.contains(a) && !space.contains(a + 0x2000));
        assert_eq!(src.mapped(), 0x4000);

        src.unmap(&mut space, b, 0x2000).expect("whole unmap");
        assert_eq!(src.mapped(), 0x2000);
        assert_eq!(
            src.unmap(&mut space, b, 0x2000),
            Err(SystemFailure::BadSpan { base: b, len: 0x2000 })
        );
    }

    #[test]
    fn remap_grows_in_place_when_free_and_moves_otherwise() {
        let mut space = AddressSpace::new();
        let mut src = MappedMemory::new();
        let a = src.map(&mut space, 0x1000).expect("map a");
        // Nothing above: in-place growth.
        assert_eq!(src.remap(&mut space, a, 0x1000, 0x3000, false).expect("grow"), a);

        let b = src.map(&mut space, 0x1000).expect("map b");
        space.write_word(b, 0x5EED).expect("seed");
        let c = src.map(&mut space, 0x1000).expect("map c blocks b");
        assert!(c > b && c < b + 0x4000, "c sits inside b's growth range");
        assert_eq!(
            src.remap(&mut space, b, 0x1000, 0x4000, false),
            Err(SystemFailure::OutOfSpace)
        );
        let moved = src.remap(&mut space, b, 0x1000, 0x4000, true).expect("move");
        assert_ne!(moved, b);
        assert_eq!(space.read_word(moved).expect("moved data"), 0x5EED);
        assert!(!space.contains(b));
    }

    #[test]
    fn unmapped_holes_are_reused() {
        let mut space = AddressSpace::new();
        let mut src = MappedMemory::new();
        let a = src.map(&mut space, 0x4000).expect("map a");
        let b = src.map(&mut space, 0x1000).expect("map b");
        src.unmap(&mut space, a, 0x4000).expect("unmap a");
        // A same-sized mapping lands back in the released range.
        let c = src.map(&mut space, 0x2000).expect("map c");
        assert_eq!(c, a, "released address range is reused first-fit");
        let d = src.map(&mut space, 0x2000).expect("map d");
        assert_eq!(d, a + 0x2000, "remaining hole is consumed from its low end");
        let _ = b;
    }

    #[test]
    fn system_memory_routes_both_strategies() {
        let mut space = AddressSpace::new();
        let mut sys = SystemMemory::new();
        let brk = sys.grow(&mut space, 0x1000).expect("grow");
        let map = sys.map(&mut space, 0x1000).expect("map");
        assert!(map > brk, "mapping range sits above the break");
        sys.unmap(&mut space, map, 0x1000).expect("unmap");
        sys.shrink(&mut space, 0x1000).expect("shrink");
    }
}
