//! The release path.
//!
//! A freed chunk is merged with a free predecessor, then with a free
//! successor: absorption into top (which may schedule a trim), into the
//! designated victim, or a plain bin reinsertion. No two physically
//! adjacent chunks are ever both free afterwards. Directly mapped chunks
//! skip all of that and are returned with a single unmap.

use crate::chunk::{INUSE_BITS, MAPPED_TAG, MEM_OFFSET, MMAP_FOOT_PAD, NIL, PINUSE};
use crate::error::HeapError;
use crate::os::PageSource;
use crate::trace::EventLevel;

use super::Arena;

impl<S: PageSource> Arena<S> {
    /// Return an allocation to the arena. Releasing address zero is a no-op.
    ///
    /// Passing anything other than a live allocation is a usage error,
    /// handled per the arena's error policy.
    pub fn release(&mut self, mem: usize) {
        if mem == 0 {
            return;
        }
        let res = self.free_inner(mem);
        let _ = self.absorb(res);
    }

    pub(super) fn free_inner(&mut self, mem: usize) -> Result<(), HeapError> {
        if mem < MEM_OFFSET {
            return Err(HeapError::UsageError {
                addr: mem,
                reason: "pointer below any possible chunk",
            });
        }
        let mut p = self.chunk_for(mem);
        if !self.ok_address(p) {
            return Err(HeapError::UsageError {
                addr: mem,
                reason: "pointer outside the arena",
            });
        }
        if !self.cinuse(p)? {
            return Err(HeapError::UsageError {
                addr: mem,
                reason: "chunk is not in use (double free?)",
            });
        }
        self.check_footer(p)?;

        let mut psize = self.chunksize(p)?;
        let next = self.next_chunk(p)?;

        if !self.pinuse(p)? {
            let prevsize = self.prev_foot(p)?;

            if prevsize & MAPPED_TAG != 0 {
                // Dedicated mapping: one unmap, bins untouched.
                let offset = prevsize & !MAPPED_TAG;
                let total = psize + offset + MMAP_FOOT_PAD;
                if self
                    .source
                    .unmap(&mut self.space, p - offset, total)
                    .is_ok()
                {
                    self.footprint -= total;
                    self.record_event(EventLevel::Info, "direct_unmap", Some(p), Some(total));
                }
                return Ok(());
            }

            // Merge backward.
            let prev = p.checked_sub(prevsize).filter(|&q| self.ok_address(q)).ok_or(
                HeapError::Corruption {
                    addr: p,
                    what: "previous-chunk offset out of range",
                },
            )?;
            psize += prevsize;
            p = prev;
            if p != self.dv {
                self.unlink_chunk(p, prevsize)?;
            } else if self.head(next)? & INUSE_BITS == INUSE_BITS {
                // No forward merge coming: the grown chunk stays the victim.
                self.dvsize = psize;
                self.set_free_with_pinuse(p, psize, next)?;
                return Ok(());
            }
        }

        if p >= next || !self.pinuse(next)? {
            return Err(HeapError::Corruption {
                addr: next,
                what: "successor chunk disagrees about this free",
            });
        }

        if !self.cinuse(next)? {
            if next == self.top {
                // Absorb into top and consider giving slack back.
                self.topsize += psize;
                let tsize = self.topsize;
                self.top = p;
                self.set_head(p, tsize | PINUSE)?;
                if p == self.dv {
                    self.dv = NIL;
                    self.dvsize = 0;
                }
                if self.should_trim(tsize) {
                    self.sys_trim(0)?;
                }
                return Ok(());
            }
            if next == self.dv {
                self.dvsize += psize;
                let dsize = self.dvsize;
                self.dv = p;
                self.set_size_and_pinuse_of_free_chunk(p, dsize)?;
                return Ok(());
            }
            let nsize = self.chunksize(next)?;
            psize += nsize;
            self.unlink_chunk(next, nsize)?;
            self.set_size_and_pinuse_of_free_chunk(p, psize)?;
            if p == self.dv {
                self.dvsize = psize;
                return Ok(());
            }
        } else {
            self.set_free_with_pinuse(p, psize, next)?;
        }

        self.insert_chunk(p, psize)
    }
}
