//! Loads that are allowed to race with the allocator's own threads.
//!
//! Every address we dereference in this crate belongs to somebody else --
//! glibc's arenas, another thread's live allocation, a chunk that is being
//! split *right now*. We never hold a reference to any of it; we copy single
//! words (or bytes) out and interpret the copy. On x86_64 an aligned `mov` is
//! a single, well-ordered access, so a torn word is impossible; what we read
//! may still be stale by the time we look at it, which is fine -- dumps are
//! snapshots, not linearizable.

/// Read one address-sized word from `src`, which may be concurrently written
/// by another thread and carries no provenance we know about.
///
/// # Safety
///
/// `src` must be aligned and mapped readable. Whether the *value* is sane is
/// the caller's problem.
#[inline(always)]
pub unsafe fn load_word(src: usize) -> usize {
    debug_assert!(src % core::mem::size_of::<usize>() == 0);
    debug_assert!(src != 0);

    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::asm;
        let out: usize;
        // Aligned 8-byte mov is atomic on x86_64, no tearing possible.
        asm! {
            "mov {out}, [{src}]",
            src = in(reg) src,
            out = out(reg) out,
            options(nostack, preserves_flags),
        }
        out
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        (src as *const usize).read_volatile()
    }
}

/// Read one byte from `src`. Same contract as [`load_word`], minus the
/// alignment requirement.
///
/// # Safety
///
/// `src` must be mapped readable.
#[inline(always)]
pub unsafe fn load_byte(src: usize) -> u8 {
    debug_assert!(src != 0);

    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::asm;
        let out: usize;
        asm! {
            "movzx {out}, byte ptr [{src}]",
            src = in(reg) src,
            out = out(reg) out,
            options(nostack, preserves_flags),
        }
        out as u8
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        (src as *const u8).read_volatile()
    }
}

/// Copy `dst.len()` bytes out of foreign memory starting at `src`, one byte
/// at a time. The copy can interleave with concurrent writes; each individual
/// byte is read whole.
///
/// # Safety
///
/// `src..src + dst.len()` must be mapped readable.
pub unsafe fn read_bytes(dst: &mut [u8], src: usize) {
    for (i, slot) in dst.iter_mut().enumerate() {
        *slot = load_byte(src + i);
    }
}
