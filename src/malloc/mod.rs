//! The glibc ptmalloc layout we interpret, as compile-time constants.
//!
//! None of this is published by any header glibc installs; it is the set of
//! facts about `malloc_state` / `heap_info` / chunk headers that has been
//! stable across the ptmalloc family for a long time. We encode exactly one
//! allocator family; other allocators (or a glibc that reshuffles
//! `malloc_state`) are explicitly unsupported.

pub mod arena;
pub mod chunk;
pub mod finder;
pub mod heap;

use core::mem;

/// P flag: the *previous* chunk is in use.
pub const PREV_INUSE: usize = 0x1;
/// M flag: the chunk was allocated with `mmap()` and is standalone.
pub const IS_MMAPPED: usize = 0x2;
/// A flag: the chunk belongs to a thread (non-main) arena.
pub const NON_MAIN_ARENA: usize = 0x4;
pub const FLAGS_MASK: usize = 0x7;

pub const SIZE_SZ: usize = mem::size_of::<usize>();

/// A chunk header is two address-sized words: `overhead` and `size`.
pub const CHUNK_HDR_SIZE: usize = 2 * SIZE_SZ;

#[cfg(target_pointer_width = "64")]
pub const DEFAULT_MMAP_THRESHOLD_MAX: usize = 4 * 1024 * 1024 * SIZE_SZ;
#[cfg(target_pointer_width = "32")]
pub const DEFAULT_MMAP_THRESHOLD_MAX: usize = 512 * 1024;

/// Every non-main heap segment is `HEAP_MAX_SIZE`-aligned and at most this
/// big, which is what makes [`segment_base`] work: masking any chunk address
/// down to this boundary lands on the segment's `heap_info` header.
pub const HEAP_MAX_SIZE: usize = 2 * DEFAULT_MMAP_THRESHOLD_MAX;

/// glibc's bin count.
pub const NBINS: usize = 128;
/// `binmap` is `NBINS` bits stored as 32-bit words.
pub const BINMAPSIZE: usize = NBINS / 32;
/// fastbin count for the reference layout (`fastbin_index(request2size(
/// MAX_FAST_SIZE)) + 1`).
pub const NFASTBINS: usize = 10;

/// Distance, in address-sized fields, from `malloc_state.top` to
/// `malloc_state.next`: `last_remainder` and the leading pair (2), the bins
/// array (`2 * NBINS - 2` pointers), and the binmap (`BINMAPSIZE` 32-bit
/// words = `BINMAPSIZE / 2` words here). 258 on the reference 64-bit layout.
/// Treated as stable for the supported allocator family; never re-derived at
/// runtime.
pub const IDX_OFFS_TOP_NEXT: usize = 2 + (2 * NBINS - 2) + BINMAPSIZE / 2;

/// How many address-sized fields of an arena the bootstrap probe is allowed
/// to scan for the top-chunk field. Generously past the end of any known
/// `malloc_state` variant.
pub const NUM_ADDR_FIELDS: usize = NFASTBINS + 2 * NBINS - 2 + BINMAPSIZE / 2 + 100;

/// The current growth boundary of the main heap: the first invalid address
/// above it, i.e. `sbrk(0)`.
pub fn growth_boundary() -> usize {
    // SAFETY: sbrk(0) moves nothing, it only reads the current break.
    unsafe { libc::sbrk(0) as usize }
}

/// Mask an address inside a non-main heap segment down to the segment's base,
/// where its `heap_info` header lives.
pub const fn segment_base(addr: usize) -> usize {
    addr & !(HEAP_MAX_SIZE - 1)
}

#[cfg(test)]
mod layout_tests {
    use super::*;

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn the_reference_constants_hold() {
        assert_eq!(CHUNK_HDR_SIZE, 16);
        assert_eq!(HEAP_MAX_SIZE, 64 * 1024 * 1024);
        assert_eq!(IDX_OFFS_TOP_NEXT, 258);
    }

    #[test]
    fn segment_base_clears_the_low_bits() {
        assert_eq!(segment_base(HEAP_MAX_SIZE), HEAP_MAX_SIZE);
        assert_eq!(segment_base(HEAP_MAX_SIZE + 12345), HEAP_MAX_SIZE);
        assert_eq!(
            segment_base(5 * HEAP_MAX_SIZE + HEAP_MAX_SIZE - 1),
            5 * HEAP_MAX_SIZE
        );
    }
}
