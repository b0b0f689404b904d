//! The malloc chunk header, decoded in place.
//!
//! A chunk is two header words followed by the user payload:
//!
//! ```text
//! chunk -> +----------------------------------+
//!          | overhead (prev size, if P clear) |
//!          +----------------------------------+
//!          | size                       |A|M|P|
//! mem ---> +----------------------------------+
//!          | payload ...                      |
//! ```
//!
//! Sizes are multiples of 8 so the low three bits of the size word carry the
//! A/M/P flags. Nothing in the header says whether *this* chunk is in use;
//! that information lives in the P bit of the *next* chunk's header.

use super::{
    heap, segment_base, CHUNK_HDR_SIZE, FLAGS_MASK, IS_MMAPPED, NON_MAIN_ARENA, PREV_INUSE,
    SIZE_SZ,
};
use crate::arch::mem::load_word;

/// A chunk header address. Copyable and inert: nothing is read until a field
/// accessor is called, so building a `Chunk` from a garbage address is safe,
/// reading from it is not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Chunk {
    addr: usize,
}

impl Chunk {
    /// Wrap a chunk header address.
    pub const fn at(addr: usize) -> Chunk {
        Chunk { addr }
    }

    /// The chunk whose payload starts at `mem` (what `malloc` returned).
    pub const fn from_mem_ptr(mem: usize) -> Chunk {
        Chunk {
            addr: mem - CHUNK_HDR_SIZE,
        }
    }

    pub const fn addr(self) -> usize {
        self.addr
    }

    /// Address of the payload, i.e. what `malloc` handed out.
    pub const fn mem_ptr(self) -> usize {
        self.addr + CHUNK_HDR_SIZE
    }

    /// First header word. Holds the previous chunk's size when that chunk is
    /// free, otherwise it belongs to the previous chunk's payload.
    ///
    /// # Safety
    ///
    /// `self.addr()` must point at a mapped, aligned chunk header.
    pub unsafe fn overhead(self) -> usize {
        load_word(self.addr)
    }

    /// Second header word, flags included.
    ///
    /// # Safety
    ///
    /// As [`Chunk::overhead`].
    pub unsafe fn raw_size(self) -> usize {
        load_word(self.addr + SIZE_SZ)
    }

    /// Chunk size in bytes, flags masked off. Always a multiple of 8.
    ///
    /// # Safety
    ///
    /// As [`Chunk::overhead`].
    pub unsafe fn size(self) -> usize {
        self.raw_size() & !FLAGS_MASK
    }

    /// P flag: the chunk *before* this one is in use.
    ///
    /// # Safety
    ///
    /// As [`Chunk::overhead`].
    pub unsafe fn prev_in_use(self) -> bool {
        self.raw_size() & PREV_INUSE != 0
    }

    /// M flag: standalone `mmap`ed chunk, not part of any arena.
    ///
    /// # Safety
    ///
    /// As [`Chunk::overhead`].
    pub unsafe fn is_mmapped(self) -> bool {
        self.raw_size() & IS_MMAPPED != 0
    }

    /// A flag: the chunk lives in a thread arena rather than the main heap.
    ///
    /// # Safety
    ///
    /// As [`Chunk::overhead`].
    pub unsafe fn in_thread_arena(self) -> bool {
        self.raw_size() & NON_MAIN_ARENA != 0
    }

    /// The physically adjacent next chunk.
    ///
    /// # Safety
    ///
    /// As [`Chunk::overhead`]. The result is only meaningful while this chunk
    /// is not the last one in its segment.
    pub unsafe fn next(self) -> Chunk {
        Chunk::at(self.addr + self.size())
    }

    /// Forward link of a chunk sitting in a free list. Garbage on a chunk in
    /// use (that word is payload).
    ///
    /// # Safety
    ///
    /// As [`Chunk::overhead`].
    pub unsafe fn next_free(self) -> usize {
        load_word(self.addr + 2 * SIZE_SZ)
    }

    /// Backward link of a chunk sitting in a free list. Same caveat as
    /// [`Chunk::next_free`].
    ///
    /// # Safety
    ///
    /// As [`Chunk::overhead`].
    pub unsafe fn prev_free(self) -> usize {
        load_word(self.addr + 3 * SIZE_SZ)
    }

    /// Bytes usable by the caller: chunk size minus the header, floored at
    /// zero so a corrupt undersized header cannot wrap.
    ///
    /// # Safety
    ///
    /// As [`Chunk::overhead`].
    pub unsafe fn payload_size(self) -> usize {
        self.size().saturating_sub(CHUNK_HDR_SIZE)
    }

    /// Is this the top chunk of its heap, given the main heap's growth
    /// boundary `brk`? The top chunk is the one that ends exactly at the
    /// heap's end: `brk` for the main heap, the segment's end for a thread
    /// heap. An `mmap`ed chunk is its own heap and counts as top.
    ///
    /// # Safety
    ///
    /// As [`Chunk::overhead`], plus the segment header must be mapped when
    /// the chunk is above `brk`.
    pub unsafe fn is_top(self, brk: usize) -> bool {
        if self.is_mmapped() {
            return true;
        }
        let end = self.addr + self.size();
        if self.addr > brk {
            let seg = heap::HeapSegment::at(segment_base(self.addr));
            end == seg.end()
        } else {
            end == brk
        }
    }

    /// Is the chunk currently allocated? `mmap`ed chunks always are (they are
    /// unmapped on free), the top chunk never is, and everything else is
    /// answered by the next chunk's P flag.
    ///
    /// # Safety
    ///
    /// As [`Chunk::is_top`], plus the next chunk's header must be mapped.
    pub unsafe fn is_in_use(self, brk: usize) -> bool {
        if self.is_mmapped() {
            return true;
        }
        if self.is_top(brk) {
            return false;
        }
        self.next().prev_in_use()
    }
}

/// Full chunk size behind a `malloc` return value, header included. Zero for
/// a null pointer.
///
/// # Safety
///
/// `mem` must be null or a pointer obtained from `malloc` and not yet freed.
pub unsafe fn allocated_chunk_size(mem: usize) -> usize {
    if mem == 0 {
        return 0;
    }
    Chunk::from_mem_ptr(mem).size()
}

/// Usable payload bytes behind a `malloc` return value. Zero for a null
/// pointer.
///
/// # Safety
///
/// As [`allocated_chunk_size`].
pub unsafe fn allocated_payload_size(mem: usize) -> usize {
    if mem == 0 {
        return 0;
    }
    Chunk::from_mem_ptr(mem).payload_size()
}
