//! Heap segments: the `heap_info` header of non-main heaps, plus the scans
//! that recover a segment's bottom and top chunks from nothing but its
//! boundaries.
//!
//! A thread arena owns a singly-linked list of `HEAP_MAX_SIZE`-aligned
//! segments, newest first via each header's `prev` pointer. The main heap has
//! no header at all; it runs from wherever the first chunk landed up to
//! `sbrk(0)`.

use super::chunk::Chunk;
use super::{segment_base, SIZE_SZ};
use crate::arch::mem::load_word;

/// One non-main heap segment, identified by its aligned base address where
/// the `heap_info { ar_ptr, prev, size }` header sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapSegment {
    base: usize,
}

impl HeapSegment {
    pub const fn at(base: usize) -> HeapSegment {
        HeapSegment { base }
    }

    /// The segment containing `addr`, by masking down to the alignment
    /// boundary. Only meaningful for addresses inside thread heaps.
    pub const fn containing(addr: usize) -> HeapSegment {
        HeapSegment {
            base: segment_base(addr),
        }
    }

    pub const fn base(self) -> usize {
        self.base
    }

    /// The arena this segment belongs to.
    ///
    /// # Safety
    ///
    /// `self.base()` must point at a mapped `heap_info` header.
    pub unsafe fn arena_ptr(self) -> usize {
        load_word(self.base)
    }

    /// The previously created segment of the same arena, if any.
    ///
    /// # Safety
    ///
    /// As [`HeapSegment::arena_ptr`].
    pub unsafe fn prev(self) -> Option<HeapSegment> {
        match load_word(self.base + SIZE_SZ) {
            0 => None,
            base => Some(HeapSegment::at(base)),
        }
    }

    /// Bytes currently in use in this segment, header included.
    ///
    /// # Safety
    ///
    /// As [`HeapSegment::arena_ptr`].
    pub unsafe fn size(self) -> usize {
        load_word(self.base + 2 * SIZE_SZ)
    }

    /// First address past the segment's used part. Chunks end here; the top
    /// chunk ends *exactly* here.
    ///
    /// # Safety
    ///
    /// As [`HeapSegment::arena_ptr`].
    pub unsafe fn end(self) -> usize {
        self.base + self.size()
    }
}

/// Step between backward scan probes. Chunk sizes are multiples of 8 and the
/// header is two words, so candidate headers sit on every other word.
pub(crate) const BACKSTEP: usize = 2 * SIZE_SZ;

/// Where does the heap holding `chunk` end? `None` for an `mmap`ed chunk,
/// which has no walkable heap around it.
///
/// # Safety
///
/// `chunk`'s header must be mapped; for thread heaps the segment header too.
pub unsafe fn heap_end(chunk: Chunk, brk: usize) -> Option<usize> {
    if chunk.is_mmapped() {
        return None;
    }
    if chunk.addr() > brk {
        Some(HeapSegment::containing(chunk.addr()).end())
    } else {
        Some(brk)
    }
}

/// Scan backwards from a `known` chunk to the deepest chunk in its segment.
///
/// Candidate headers are probed every [`BACKSTEP`] bytes down to `floor`
/// (exclusive). A candidate is accepted when its size word points exactly at
/// the last chunk we already trust; accepted candidates become the new trust
/// anchor, so the scan ratchets downward and returns the deepest plausible
/// bottom. This is a heuristic: a payload word that happens to mimic a valid
/// size can fool it, which is acceptable for diagnostics.
///
/// # Safety
///
/// `floor..=known.addr()` must be mapped readable and word-aligned.
pub unsafe fn bottom_chunk_from(floor: usize, known: Chunk) -> Chunk {
    let mut last_valid = known;
    let mut probe = known.addr();
    while probe > floor + BACKSTEP {
        probe -= BACKSTEP;
        let candidate = Chunk::at(probe);
        if candidate.next() == last_valid {
            last_valid = candidate;
        }
    }
    last_valid
}

/// Find the top chunk of a segment by the same backward scan: the top chunk
/// is the one whose size lands exactly on the segment's end.
///
/// # Safety
///
/// The whole used part of the segment must be mapped readable.
pub unsafe fn top_chunk_of(seg: HeapSegment) -> Option<Chunk> {
    let end = seg.end();
    let floor = seg.base();
    let mut probe = end;
    while probe > floor + BACKSTEP {
        probe -= BACKSTEP;
        let candidate = Chunk::at(probe);
        let size = candidate.size();
        if size != 0 && probe + size == end {
            return Some(candidate);
        }
    }
    None
}

/// Collect the bottom chunk of every segment of the arena whose top chunk is
/// at `ar_top`, newest segment first, into `out`. Returns how many entries
/// were written; the rest of `out` is zeroed. When `ar_top` is below `brk`
/// the arena is the main arena and the single answer is `main_bottom`.
///
/// The walk is defensive: a segment whose recorded size is zero or whose top
/// chunk overruns the segment end terminates the walk with what was gathered
/// so far (or nothing, if even the first segment is bad).
///
/// # Safety
///
/// `ar_top`, when nonzero and above `brk`, must point into a mapped thread
/// heap segment with a mapped header chain.
pub unsafe fn all_segment_bottoms(
    ar_top: usize,
    brk: usize,
    main_bottom: Chunk,
    out: &mut [usize],
) -> usize {
    out.fill(0);
    if ar_top == 0 || out.is_empty() {
        return 0;
    }
    if ar_top < brk {
        out[0] = main_bottom.addr();
        return 1;
    }

    // Segments are discovered oldest-last, so fill from the rear and
    // left-pack afterwards to keep newest-first order starting at index 0.
    let mut write = out.len();
    let mut seg = HeapSegment::containing(ar_top);
    let mut chunk = Chunk::at(ar_top);
    loop {
        if seg.size() == 0 || chunk.next().addr() > seg.end() {
            if write == out.len() {
                return 0;
            }
            break;
        }
        // The header ends at base + 3 words; the first chunk can start
        // anywhere past it, aligned to BACKSTEP.
        let floor = seg.base() + 2 * SIZE_SZ;
        let bottom = bottom_chunk_from(floor, chunk);
        if write == 0 {
            break;
        }
        write -= 1;
        out[write] = bottom.addr();

        seg = match seg.prev() {
            Some(prev) => prev,
            None => break,
        };
        chunk = match top_chunk_of(seg) {
            Some(top) => top,
            None => break,
        };
    }

    let count = out.len() - write;
    out.copy_within(write.., 0);
    out[count..].fill(0);
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::fixture::{self, FakeArenas};
    use crate::malloc::{growth_boundary, PREV_INUSE};

    #[test]
    fn backward_scan_finds_the_buffer_bottom() {
        // |used 64|top 64| in a Vec; scan starts from the top chunk.
        let mut buf = vec![0usize; 16];
        let base = buf.as_ptr() as usize;
        buf[1] = 64 | PREV_INUSE;
        buf[9] = 64 | PREV_INUSE;
        unsafe {
            let bottom = bottom_chunk_from(base - BACKSTEP, Chunk::at(base + 64));
            assert_eq!(bottom.addr(), base);
        }
    }

    #[test]
    fn backward_scan_keeps_the_anchor_without_a_match() {
        let buf = vec![0usize; 16];
        let base = buf.as_ptr() as usize;
        let known = Chunk::at(base + 64);
        unsafe {
            // All-zero memory offers no candidate whose size links forward.
            assert_eq!(bottom_chunk_from(base, known), known);
        }
    }

    #[test]
    fn segment_header_fields_decode() {
        let fx = FakeArenas::build();
        let seg = HeapSegment::at(fx.new_seg);
        unsafe {
            assert_eq!(seg.arena_ptr(), fx.thread_arena);
            assert_eq!(seg.prev(), Some(HeapSegment::at(fx.old_seg)));
            assert_eq!(seg.size(), fixture::NEW_SEG_SIZE);
            assert_eq!(seg.end(), fx.new_seg + fixture::NEW_SEG_SIZE);
        }
    }

    #[test]
    fn top_chunk_scan_lands_on_the_segment_end() {
        let fx = FakeArenas::build();
        unsafe {
            let top = top_chunk_of(HeapSegment::at(fx.old_seg));
            assert_eq!(top.map(Chunk::addr), Some(fx.top_of_old_seg()));
        }
    }

    #[test]
    fn heap_end_distinguishes_main_and_thread_heaps() {
        let fx = FakeArenas::build();
        unsafe {
            let thread_chunk = Chunk::at(fx.new_seg + fixture::NEW_FIRST_CHUNK);
            assert_eq!(
                heap_end(thread_chunk, fx.brk),
                Some(fx.new_seg + fixture::NEW_SEG_SIZE)
            );

            // Any readable header below the break takes the main-heap path.
            let main_chunk = Chunk::at(fx.old_seg + 512);
            assert_eq!(heap_end(main_chunk, fx.brk), Some(fx.brk));
        }
    }

    #[test]
    fn segment_bottoms_come_newest_first_and_left_packed() {
        let fx = FakeArenas::build();
        let mut out = [0usize; 8];
        unsafe {
            let dummy_main = Chunk::at(0x1000);
            let n = all_segment_bottoms(fx.top_of_new_seg(), fx.brk, dummy_main, &mut out);
            assert_eq!(n, 2);
            assert_eq!(out[0], fx.new_seg + fixture::NEW_FIRST_CHUNK);
            assert_eq!(out[1], fx.old_seg + fixture::OLD_FIRST_CHUNK);
            assert!(out[2..].iter().all(|&w| w == 0));
        }
    }

    #[test]
    fn a_main_arena_top_yields_the_main_bottom() {
        let fx = FakeArenas::build();
        let main_bottom = Chunk::at(0x4000);
        let mut out = [0usize; 4];
        unsafe {
            let n = all_segment_bottoms(fx.main_top(), fx.brk, main_bottom, &mut out);
            assert_eq!(n, 1);
            assert_eq!(out[0], 0x4000);
        }
    }

    #[test]
    fn a_null_top_yields_nothing() {
        let mut out = [0usize; 4];
        unsafe {
            assert_eq!(all_segment_bottoms(0, growth_boundary(), Chunk::at(0), &mut out), 0);
        }
    }
}
