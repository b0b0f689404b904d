//! Arenas (`malloc_state`) as arrays of address-sized fields.
//!
//! We never know the struct's real field names at runtime, only two indices:
//! where `top` is and where `next` is. The top index is found empirically at
//! bootstrap by scanning a thread arena for a field holding a known top-chunk
//! address; the next index is a fixed offset from it (see
//! [`super::IDX_OFFS_TOP_NEXT`]). Both indices transfer to every other arena
//! because all arenas share one struct layout.

use super::chunk::Chunk;
use super::heap::HeapSegment;
use super::{HEAP_MAX_SIZE, IDX_OFFS_TOP_NEXT, NUM_ADDR_FIELDS, SIZE_SZ};
use crate::arch::mem::load_word;

/// An arena base address. Like [`Chunk`], inert until a field is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Arena {
    base: usize,
}

/// The two field indices that make an arena readable. Discovered once,
/// then valid for every arena in the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaLayout {
    pub top_idx: usize,
    pub next_idx: usize,
}

impl ArenaLayout {
    pub const fn from_top_index(top_idx: usize) -> ArenaLayout {
        ArenaLayout {
            top_idx,
            next_idx: top_idx + IDX_OFFS_TOP_NEXT,
        }
    }
}

impl Arena {
    pub const fn at(base: usize) -> Arena {
        Arena { base }
    }

    pub const fn base(self) -> usize {
        self.base
    }

    /// Read field `idx` of the arena struct.
    ///
    /// # Safety
    ///
    /// The arena struct at `self.base()` must be mapped readable.
    pub unsafe fn field(self, idx: usize) -> usize {
        load_word(self.base + idx * SIZE_SZ)
    }

    /// This arena's current top chunk address.
    ///
    /// # Safety
    ///
    /// As [`Arena::field`]; `layout` must come from this process's bootstrap.
    pub unsafe fn top(self, layout: ArenaLayout) -> usize {
        self.field(layout.top_idx)
    }

    /// The raw `next` pointer of glibc's circular arena list.
    ///
    /// # Safety
    ///
    /// As [`Arena::top`].
    pub unsafe fn next_ptr(self, layout: ArenaLayout) -> usize {
        self.field(layout.next_idx)
    }
}

/// Upper bound on any arena-list walk. glibc caps arenas at a small multiple
/// of the CPU count; anything past this is a corrupt or cyclic list.
pub const MAX_ARENA_WALK: usize = 64;

/// Scan `arena`'s first [`NUM_ADDR_FIELDS`] fields for one holding
/// `candidate_top`. This is how the top-field index is learned: the caller
/// knows where the arena's top chunk must be and asks which field says so.
///
/// # Safety
///
/// `NUM_ADDR_FIELDS` words starting at `arena.base()` must be mapped
/// readable.
pub unsafe fn find_top_index(arena: Arena, candidate_top: usize) -> Option<usize> {
    (0..NUM_ADDR_FIELDS).find(|&idx| arena.field(idx) == candidate_top)
}

/// Follow the arena list from `start` until an arena whose top chunk lies in
/// the main heap (at or below `brk`). That arena is the main arena. `None`
/// when the list nulls out, cycles back to `start`, or exceeds
/// [`MAX_ARENA_WALK`] hops.
///
/// # Safety
///
/// Every arena struct reachable through the list must be mapped readable.
pub unsafe fn find_main_arena(start: Arena, layout: ArenaLayout, brk: usize) -> Option<Arena> {
    let mut current = start;
    for _ in 0..MAX_ARENA_WALK {
        let top = current.top(layout);
        if top != 0 && top <= brk {
            return Some(current);
        }
        match current.next_ptr(layout) {
            0 => return None,
            next if next == start.base() => return None,
            next => current = Arena::at(next),
        }
    }
    None
}

/// The arena after `arena` in iteration order, treating the main arena as the
/// list's terminator so callers see a linear list instead of glibc's circle.
///
/// # Safety
///
/// As [`Arena::top`].
pub unsafe fn next_arena(arena: Arena, main: Arena, layout: ArenaLayout) -> Option<Arena> {
    match arena.next_ptr(layout) {
        0 => None,
        next if next == main.base() => None,
        next => Some(Arena::at(next)),
    }
}

/// Which arena owns `chunk`? Main-heap chunks belong to the main arena. A
/// thread-heap chunk is owned by the arena whose current top chunk lies in
/// the same aligned segment window; the segment header's `ar_ptr` is tried
/// first as a hint, then the arena list is searched with the same predicate.
/// `None` when no arena's top is in the window, which includes chunks in an
/// arena's older (non-top) segments.
///
/// # Safety
///
/// `chunk`'s header, its segment header, and all reachable arena structs must
/// be mapped readable.
pub unsafe fn owning_arena(chunk: Chunk, main: Arena, layout: ArenaLayout) -> Option<Arena> {
    if !chunk.in_thread_arena() {
        return Some(main);
    }
    let seg = HeapSegment::containing(chunk.addr());
    let window = seg.base()..seg.base() + HEAP_MAX_SIZE;
    let hinted = seg.arena_ptr();
    if hinted != 0 && window.contains(&Arena::at(hinted).top(layout)) {
        return Some(Arena::at(hinted));
    }
    // Aliased or torn header; fall back to searching the list.
    let mut current = main;
    for _ in 0..MAX_ARENA_WALK {
        if window.contains(&current.top(layout)) {
            return Some(current);
        }
        match current.next_ptr(layout) {
            0 => return None,
            next if next == main.base() => return None,
            next => current = Arena::at(next),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::fixture::{self, FakeArenas};

    fn layout() -> ArenaLayout {
        ArenaLayout::from_top_index(fixture::TOP_IDX)
    }

    #[test]
    fn layout_places_next_at_the_fixed_offset() {
        let l = ArenaLayout::from_top_index(13);
        assert_eq!(l.next_idx, 13 + IDX_OFFS_TOP_NEXT);
    }

    #[test]
    fn top_index_is_rediscovered_by_scanning() {
        let fx = FakeArenas::build();
        unsafe {
            let idx = find_top_index(Arena::at(fx.thread_arena), fx.top_of_new_seg());
            assert_eq!(idx, Some(fixture::TOP_IDX));
        }
    }

    #[test]
    fn an_unknown_top_is_not_found() {
        let fx = FakeArenas::build();
        unsafe {
            assert_eq!(find_top_index(Arena::at(fx.thread_arena), 0xdead_b000), None);
        }
    }

    #[test]
    fn the_chain_walk_reaches_the_main_arena() {
        let fx = FakeArenas::build();
        unsafe {
            let main = find_main_arena(Arena::at(fx.thread_arena), layout(), fx.brk);
            assert_eq!(main.map(Arena::base), Some(fx.main_arena_addr()));
        }
    }

    #[test]
    fn a_cycle_without_a_main_arena_gives_up() {
        let mut fx = FakeArenas::build();
        // Push the fake main arena's top above the break so no arena
        // qualifies; the circular list must then be detected, not spun on.
        fx.main_arena[fixture::TOP_IDX] = usize::MAX - 4096;
        unsafe {
            let main = find_main_arena(Arena::at(fx.thread_arena), layout(), fx.brk);
            assert_eq!(main, None);
        }
    }

    #[test]
    fn next_arena_treats_main_as_the_end() {
        let fx = FakeArenas::build();
        let main = Arena::at(fx.main_arena_addr());
        unsafe {
            let after_thread = next_arena(Arena::at(fx.thread_arena), main, layout());
            assert_eq!(after_thread, None, "thread arena links straight to main");
        }
    }

    #[test]
    fn owning_arena_reads_the_segment_hint() {
        let fx = FakeArenas::build();
        let main = Arena::at(fx.main_arena_addr());
        unsafe {
            // The arena's current top lives in new_seg, so ownership of a
            // new_seg chunk is confirmed straight from the header hint.
            let c = Chunk::at(fx.new_seg + fixture::NEW_FIRST_CHUNK);
            let owner = owning_arena(c, main, layout());
            assert_eq!(owner.map(Arena::base), Some(fx.thread_arena));
        }
    }

    #[test]
    fn owning_arena_falls_back_to_the_list_on_a_bad_hint() {
        let fx = FakeArenas::build();
        let main = Arena::at(fx.main_arena_addr());
        unsafe {
            // Zero out new_seg's ar_ptr; the owner must still be found by
            // searching the arena list for a top inside the window.
            (fx.new_seg as *mut usize).write(0);
            let c = Chunk::at(fx.new_seg + fixture::NEW_FIRST_CHUNK);
            let owner = owning_arena(c, main, layout());
            assert_eq!(owner.map(Arena::base), Some(fx.thread_arena));
        }
    }

    #[test]
    fn main_heap_chunks_belong_to_the_main_arena() {
        let fx = FakeArenas::build();
        let main = Arena::at(fx.main_arena_addr());
        let mut buf = vec![0usize; 4];
        buf[1] = 16 | crate::malloc::PREV_INUSE; // A flag clear
        unsafe {
            let owner = owning_arena(Chunk::at(buf.as_ptr() as usize), main, layout());
            assert_eq!(owner, Some(main));
        }
    }
}
