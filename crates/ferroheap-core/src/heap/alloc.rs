//! The allocation path.
//!
//! Requests are serviced in strict priority order: remainderless small-bin
//! hit, split of the next nonempty small bin (remainder becomes the
//! designated victim), tree search, designated victim, top chunk, and only
//! then the system. Large requests go straight to the tree search.

use crate::chunk::{
    MIN_CHUNK_SIZE, NIL, least_bit, left_bits, leftshift_for_tree_index, max_small_request,
    small_index, small_index_to_size, tree_index,
};
use crate::error::HeapError;
use crate::os::PageSource;

use super::Arena;

impl<S: PageSource> Arena<S> {
    /// Allocate at least `bytes` usable bytes. Returns the payload address,
    /// or `None` on exhaustion (or, under the proceed policy, after a
    /// detected corruption).
    pub fn allocate(&mut self, bytes: usize) -> Option<usize> {
        let res = self.alloc_inner(bytes);
        self.absorb(res)
    }

    /// Allocate zeroed space for `count` elements of `elem_size` bytes,
    /// failing on multiplication overflow before any system call.
    pub fn allocate_zeroed(&mut self, count: usize, elem_size: usize) -> Option<usize> {
        let res = self.calloc_inner(count, elem_size);
        self.absorb(res)
    }

    fn calloc_inner(&mut self, count: usize, elem_size: usize) -> Result<usize, HeapError> {
        let req = count
            .checked_mul(elem_size)
            .ok_or(HeapError::AllocationFailed { requested: usize::MAX })?;
        let mem = self.alloc_inner(req)?;
        let p = self.chunk_for(mem);
        // Dedicated mappings come back zero-filled from the system; binned
        // chunks may carry stale payload or old link words.
        if req > 0 && !self.is_direct(p)? {
            self.space.fill(mem, req, 0)?;
        }
        Ok(mem)
    }

    pub(crate) fn alloc_inner(&mut self, bytes: usize) -> Result<usize, HeapError> {
        let nb = self.request_to_chunk(bytes)?;
        if bytes <= max_small_request(self.chunk_overhead()) {
            let idx = small_index(nb);
            let smallbits = self.smallmap >> idx;

            if smallbits & 0b11 != 0 {
                // Remainderless fit in this bin or the next one up.
                let i = idx + (!smallbits as usize & 1);
                let p = self.unlink_first_small_chunk(i)?;
                self.set_inuse_and_pinuse(p, small_index_to_size(i))?;
                return Ok(self.mem_for(p));
            }

            if nb > self.dvsize {
                if smallbits != 0 {
                    // Split the next nonempty small bin; the remainder
                    // becomes the new designated victim.
                    let leftbits = (smallbits << idx) & left_bits(1u32 << idx);
                    let i = least_bit(leftbits).trailing_zeros() as usize;
                    let p = self.unlink_first_small_chunk(i)?;
                    let size = small_index_to_size(i);
                    let rsize = size - nb;
                    if rsize < MIN_CHUNK_SIZE {
                        self.set_inuse_and_pinuse(p, size)?;
                    } else {
                        self.set_size_and_pinuse_of_inuse_chunk(p, nb)?;
                        let r = p + nb;
                        self.set_size_and_pinuse_of_free_chunk(r, rsize)?;
                        self.replace_dv(r, rsize)?;
                    }
                    return Ok(self.mem_for(p));
                }

                if self.treemap != 0 {
                    return self.tmalloc_small(nb);
                }
            }
        } else if self.treemap != 0 {
            if let Some(mem) = self.tmalloc_large(nb)? {
                return Ok(mem);
            }
        }

        // Designated victim.
        if nb <= self.dvsize {
            let p = self.dv;
            let rsize = self.dvsize - nb;
            if rsize >= MIN_CHUNK_SIZE {
                let r = p + nb;
                self.dv = r;
                self.dvsize = rsize;
                self.set_size_and_pinuse_of_free_chunk(r, rsize)?;
                self.set_size_and_pinuse_of_inuse_chunk(p, nb)?;
            } else {
                // Exhaust the victim rather than leave an unusable sliver.
                let dvs = self.dvsize;
                self.dv = NIL;
                self.dvsize = 0;
                self.set_inuse_and_pinuse(p, dvs)?;
            }
            return Ok(self.mem_for(p));
        }

        // Top chunk.
        if nb < self.topsize {
            let p = self.split_top(nb)?;
            return Ok(self.mem_for(p));
        }

        self.sys_alloc(nb)
    }

    /// Carve `nb` bytes from the bottom of the top chunk.
    pub(crate) fn split_top(&mut self, nb: usize) -> Result<usize, HeapError> {
        debug_assert!(nb < self.topsize);
        let p = self.top;
        let rsize = self.topsize - nb;
        let r = p + nb;
        self.top = r;
        self.topsize = rsize;
        self.set_head(r, rsize | crate::chunk::PINUSE)?;
        self.set_size_and_pinuse_of_inuse_chunk(p, nb)?;
        Ok(p)
    }

    /// Best-fit search of the tree bins for a large request. Returns `None`
    /// when no tree chunk beats the designated victim.
    pub(crate) fn tmalloc_large(&mut self, nb: usize) -> Result<Option<usize>, HeapError> {
        let mut v = NIL;
        // Wrapped arithmetic mirrors the original: a chunk smaller than nb
        // produces a huge "remainder" and is never selected.
        let mut rsize = nb.wrapping_neg();
        let idx = tree_index(nb);
        let mut t = self.treebins[idx];

        if t != NIL {
            // Walk down the trie for this bin looking for an exact fit,
            // remembering the deepest untaken right subtree.
            let mut sizebits = nb << leftshift_for_tree_index(idx);
            let mut rst = NIL;
            loop {
                self.check_link(t, "tree search node")?;
                let trem = self.chunksize(t)?.wrapping_sub(nb);
                if trem < rsize {
                    v = t;
                    rsize = trem;
                    if trem == 0 {
                        break;
                    }
                }
                let rt = self.child(t, 1)?;
                t = self.child(t, (sizebits >> (usize::BITS - 1)) & 1)?;
                if rt != NIL && rt != t {
                    rst = rt;
                }
                if t == NIL {
                    // Least subtree holding sizes above nb.
                    t = rst;
                    break;
                }
                sizebits <<= 1;
            }
        }

        if t == NIL && v == NIL {
            // Nothing in nb's own bin: take the root of the next nonempty
            // tree bin to the left.
            let leftbits = left_bits(1u32 << idx) & self.treemap;
            if leftbits != 0 {
                let i = least_bit(leftbits).trailing_zeros() as usize;
                t = self.treebins[i];
            }
        }

        // Descend to the leftmost leaf, tracking the minimum remainder.
        while t != NIL {
            self.check_link(t, "tree descent node")?;
            let trem = self.chunksize(t)?.wrapping_sub(nb);
            if trem < rsize {
                rsize = trem;
                v = t;
            }
            t = self.leftmost_child(t)?;
        }

        // Use the tree chunk only if it beats the designated victim.
        if v != NIL && rsize < self.dvsize.wrapping_sub(nb) {
            self.check_link(v, "tree victim")?;
            let r = v + nb;
            if v >= r {
                return Err(HeapError::Corruption {
                    addr: v,
                    what: "tree victim size wraps",
                });
            }
            self.unlink_large_chunk(v)?;
            if rsize < MIN_CHUNK_SIZE {
                self.set_inuse_and_pinuse(v, rsize + nb)?;
            } else {
                self.set_size_and_pinuse_of_inuse_chunk(v, nb)?;
                self.set_size_and_pinuse_of_free_chunk(r, rsize)?;
                self.insert_chunk(r, rsize)?;
            }
            return Ok(Some(self.mem_for(v)));
        }
        Ok(None)
    }

    /// Service a small request from the tree bins: best fit within the
    /// lowest nonempty bin, remainder becomes the designated victim.
    pub(crate) fn tmalloc_small(&mut self, nb: usize) -> Result<usize, HeapError> {
        let i = least_bit(self.treemap).trailing_zeros() as usize;
        let mut t = self.treebins[i];
        self.check_link(t, "tree bin root")?;
        let mut v = t;
        let mut rsize = self.chunksize(t)? - nb;

        loop {
            t = self.leftmost_child(t)?;
            if t == NIL {
                break;
            }
            self.check_link(t, "tree descent node")?;
            let trem = self.chunksize(t)? - nb;
            if trem < rsize {
                rsize = trem;
                v = t;
            }
        }

        let r = v + nb;
        if v >= r {
            return Err(HeapError::Corruption {
                addr: v,
                what: "tree victim size wraps",
            });
        }
        self.unlink_large_chunk(v)?;
        if rsize < MIN_CHUNK_SIZE {
            self.set_inuse_and_pinuse(v, rsize + nb)?;
        } else {
            self.set_size_and_pinuse_of_inuse_chunk(v, nb)?;
            self.set_size_and_pinuse_of_free_chunk(r, rsize)?;
            self.replace_dv(r, rsize)?;
        }
        Ok(self.mem_for(v))
    }
}
