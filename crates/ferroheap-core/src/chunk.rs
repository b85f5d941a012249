//! Chunk header layout and bin index arithmetic.
//!
//! A chunk is the allocator's unit of memory: two header words followed by
//! payload. The same payload bytes are reinterpreted as free-list links or
//! tree-node fields while the chunk sits in a bin, so every field here is an
//! offset into the owning arena's address space rather than a typed struct.
//!
//! Layout, in words relative to the chunk address:
//!
//! ```text
//! +0  prev_foot   size of the previous chunk (only valid while the previous
//!                 chunk is free), or the map offset tag for direct chunks
//! +1  head        chunk size | PINUSE | CINUSE
//! +2  fd          forward link        (free chunks)
//! +3  bk          backward link       (free chunks)
//! +4  child[0]    left child          (free tree chunks)
//! +5  child[1]    right child         (free tree chunks)
//! +6  parent      parent node         (free tree chunks)
//! +7  index       cached tree-bin index
//! ```

/// One header word.
pub const WORD: usize = size_of::<usize>();

/// Payload alignment guaranteed by every allocation.
pub const ALIGNMENT: usize = 2 * WORD;

/// Mask of the low bits that must be clear in an aligned size or address.
pub const ALIGN_MASK: usize = ALIGNMENT - 1;

/// Smallest chunk the allocator will carve: header plus both list links.
pub const MIN_CHUNK_SIZE: usize = (4 * WORD + ALIGN_MASK) & !ALIGN_MASK;

/// Per-chunk bookkeeping overhead without footer tags.
pub const CHUNK_OVERHEAD: usize = WORD;

/// Per-chunk bookkeeping overhead with footer tags enabled.
pub const FOOTER_CHUNK_OVERHEAD: usize = 2 * WORD;

/// Overhead carried by a directly mapped chunk.
pub const MMAP_CHUNK_OVERHEAD: usize = 2 * WORD;

/// Trailing pad on a direct mapping holding the fake next-chunk fields.
pub const MMAP_FOOT_PAD: usize = 4 * WORD;

/// Requests at or above this ceiling fail immediately, with no system call.
pub const MAX_REQUEST: usize = usize::MAX / 2;

/// Previous chunk is in use.
pub const PINUSE: usize = 1;
/// This chunk is in use.
pub const CINUSE: usize = 2;
/// Both in-use bits.
pub const INUSE_BITS: usize = PINUSE | CINUSE;

/// Low bit of `prev_foot` tagging a directly mapped chunk.
pub const MAPPED_TAG: usize = 1;

/// Head value written into segment-boundary fenceposts.
pub const FENCEPOST_HEAD: usize = INUSE_BITS | WORD;

/// Offset from a chunk address to the payload handed to the caller.
pub const MEM_OFFSET: usize = 2 * WORD;

/// Reserved tail space in every segment: room for fenceposts plus slack so
/// top can always be split or fenced off when the segment is extended.
pub const TOP_FOOT_SIZE: usize = MIN_CHUNK_SIZE + 2 * WORD;

pub const NSMALLBINS: usize = 32;
pub const NTREEBINS: usize = 32;
pub const SMALLBIN_SHIFT: u32 = 3;
pub const TREEBIN_SHIFT: u32 = 8;

/// Smallest size classified into a tree bin.
pub const MIN_LARGE_SIZE: usize = 1 << TREEBIN_SHIFT;
pub const MAX_SMALL_SIZE: usize = MIN_LARGE_SIZE - 1;

/// Field offsets within a free chunk.
pub const FD_OFFSET: usize = 2 * WORD;
pub const BK_OFFSET: usize = 3 * WORD;
pub const CHILD_OFFSET: [usize; 2] = [4 * WORD, 5 * WORD];
pub const PARENT_OFFSET: usize = 6 * WORD;
pub const INDEX_OFFSET: usize = 7 * WORD;

/// Sentinel for "no chunk". No region is ever placed at address zero.
pub const NIL: usize = 0;

/// Reserved `parent` value marking the root node of a tree bin. Real chunk
/// addresses are always `ALIGNMENT`-aligned, so this cannot collide.
pub const TREE_ROOT: usize = 1;

/// Payload address for a chunk.
#[inline]
pub fn mem_for(chunk: usize) -> usize {
    chunk + MEM_OFFSET
}

/// Chunk address for a payload pointer.
#[inline]
pub fn chunk_for(mem: usize) -> usize {
    mem - MEM_OFFSET
}

#[inline]
pub fn is_aligned(addr: usize) -> bool {
    addr & ALIGN_MASK == 0
}

/// Round a request up to a usable chunk size, including `overhead` bytes of
/// bookkeeping (one word, or two when footer tags are enabled).
#[inline]
pub fn pad_request(req: usize, overhead: usize) -> usize {
    (req + overhead + ALIGN_MASK) & !ALIGN_MASK
}

/// Like [`pad_request`] but enforcing the minimum chunk size.
#[inline]
pub fn request_to_chunk(req: usize, overhead: usize) -> usize {
    if req < MIN_CHUNK_SIZE - overhead {
        MIN_CHUNK_SIZE
    } else {
        pad_request(req, overhead)
    }
}

/// Largest request still serviced from the small bins.
#[inline]
pub fn max_small_request(overhead: usize) -> usize {
    MAX_SMALL_SIZE - ALIGN_MASK - overhead
}

#[inline]
pub fn is_small(chunk_size: usize) -> bool {
    (chunk_size >> SMALLBIN_SHIFT) < NSMALLBINS
}

#[inline]
pub fn small_index(chunk_size: usize) -> usize {
    chunk_size >> SMALLBIN_SHIFT
}

#[inline]
pub fn small_index_to_size(idx: usize) -> usize {
    idx << SMALLBIN_SHIFT
}

/// Tree-bin index for a large chunk size: two bins per power of two, picked
/// by the highest set bit of `size >> TREEBIN_SHIFT` refined by the next
/// lower bit.
pub fn tree_index(size: usize) -> usize {
    let x = size >> TREEBIN_SHIFT;
    if x == 0 {
        0
    } else if x > 0xFFFF {
        NTREEBINS - 1
    } else {
        let k = (usize::BITS - 1 - x.leading_zeros()) as usize;
        (k << 1) + ((size >> (k + TREEBIN_SHIFT as usize - 1)) & 1)
    }
}

/// Shift that places the highest unresolved size bit of tree bin `idx` at
/// the sign position, driving left/right child selection during trie walks.
#[inline]
pub fn leftshift_for_tree_index(idx: usize) -> u32 {
    if idx == NTREEBINS - 1 {
        0
    } else {
        usize::BITS - 1 - (idx as u32 / 2 + TREEBIN_SHIFT - 2)
    }
}

/// Smallest chunk size held by tree bin `idx`.
#[inline]
pub fn minsize_for_tree_index(idx: usize) -> usize {
    (1usize << ((idx >> 1) + TREEBIN_SHIFT as usize))
        | ((idx & 1) << ((idx >> 1) + TREEBIN_SHIFT as usize - 1))
}

/// Isolate the least significant set bit.
#[inline]
pub fn least_bit(x: u32) -> u32 {
    x & x.wrapping_neg()
}

/// Mask of all bits strictly left of the least bit of `x`.
#[inline]
pub fn left_bits(x: u32) -> u32 {
    (x << 1) | (x << 1).wrapping_neg()
}
