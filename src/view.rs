//! Process-wide heap view: built once, read forever.
//!
//! [`init`] captures everything that must be learned early (the address-space
//! bounds, the heap's bottom chunk, the main arena) and caches it in a
//! process-global [`HeapView`]. The capture order matters: the bottom chunk
//! is whatever `malloc` hands out first, so `init` should run before the
//! program allocates anything else or the recorded bottom will sit above the
//! true one.

use std::io::{self, Write};

use once_cell::sync::OnceCell;

use crate::arch::bounds::{self, AddressSpaceBounds};
use crate::dump::{self, hex, Totals};
use crate::error::HeapError;
use crate::malloc::chunk::Chunk;
use crate::malloc::finder::{self, MainArena};
use crate::malloc::{growth_boundary, SIZE_SZ};

static VIEW: OnceCell<HeapView> = OnceCell::new();

/// Everything [`init`] discovered. Immutable after construction; all methods
/// take `&self` and may be called from any thread.
#[derive(Debug)]
pub struct HeapView {
    bounds: AddressSpaceBounds,
    heap_bottom: Chunk,
    main_arena: Option<MainArena>,
}

/// The coarse memory map of the process, as reported by
/// [`HeapView::memory_bounds`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBounds {
    pub max_addr: usize,
    pub max_user_addr: usize,
    pub stack_top: usize,
    pub heap_bottom_chunk: usize,
}

/// Extent of the contiguous main heap, bottom chunk to `sbrk(0)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapLimit {
    /// Total bytes between the bottom chunk and the growth boundary.
    pub size: usize,
    /// Address of the main heap's top chunk.
    pub heap_top_chunk: usize,
    /// First address past the top chunk, equal to `sbrk(0)`.
    pub heap_top_end: usize,
}

/// Build the heap view, or return the one already built. Idempotent; only
/// the first call does any work. Call it as the first thing in `main`.
///
/// With `verbose`, the discovery steps are narrated through [`log`].
pub fn init(verbose: bool) -> &'static HeapView {
    VIEW.get_or_init(|| bootstrap(verbose))
}

/// The view built by [`init`], or [`HeapError::NotInitialized`].
pub fn try_get() -> Result<&'static HeapView, HeapError> {
    VIEW.get().ok_or(HeapError::NotInitialized)
}

fn bootstrap(verbose: bool) -> HeapView {
    let bounds = bounds::detect();
    if verbose {
        log::info!(
            "address space: max {:#x}, user {:#x}, stack top {:#x}",
            bounds.max_addr,
            bounds.max_user_addr,
            bounds.stack_top
        );
    }

    // The next allocation marks (or sits immediately above) the heap's
    // bottom; grab its chunk header address and give the block back.
    // SAFETY: the header is read while the block is live.
    let heap_bottom = unsafe {
        let mem = libc::malloc(4 * SIZE_SZ);
        if mem.is_null() {
            log::error!("bootstrap allocation failed; heap dumps are unavailable");
            Chunk::at(0)
        } else {
            let c = Chunk::from_mem_ptr(mem as usize);
            libc::free(mem);
            c
        }
    };
    if verbose && heap_bottom.addr() != 0 {
        log::info!(
            "heap bottom chunk at {:#x}, growth boundary {:#x}",
            heap_bottom.addr(),
            growth_boundary()
        );
    }

    let main_arena = finder::discover();
    match main_arena {
        Some(m) if verbose => {
            log::info!(
                "main arena at {:#x}, top field index {}",
                m.arena.base(),
                m.layout.top_idx
            );
        }
        None => log::warn!("{}", HeapError::ArenaNotFound),
        _ => {}
    }

    HeapView {
        bounds,
        heap_bottom,
        main_arena,
    }
}

impl HeapView {
    pub fn memory_bounds(&self) -> MemoryBounds {
        MemoryBounds {
            max_addr: self.bounds.max_addr,
            max_user_addr: self.bounds.max_user_addr,
            stack_top: self.bounds.stack_top,
            heap_bottom_chunk: self.heap_bottom.addr(),
        }
    }

    /// The main arena, when bootstrap discovery succeeded.
    pub fn main_arena(&self) -> Option<&MainArena> {
        self.main_arena.as_ref()
    }

    fn bottom(&self) -> Result<Chunk, HeapError> {
        if self.heap_bottom.addr() == 0 {
            return Err(HeapError::InvalidRange("heap bottom is unavailable"));
        }
        Ok(self.heap_bottom)
    }

    /// Measure the contiguous main heap by walking it bottom to top. The
    /// walk never dereferences at or past the growth boundary; a header that
    /// would step outside it is reported as malformed instead.
    pub fn contiguous_heap_limit(&self) -> Result<HeapLimit, HeapError> {
        let bottom = self.bottom()?;
        let brk = growth_boundary();
        let mut chunk = bottom;
        let mut size = 0usize;
        loop {
            if chunk.addr() >= brk {
                return Err(HeapError::MalformedChunk { addr: chunk.addr() });
            }
            // SAFETY: chunk.addr() is inside the mapped main heap, below brk.
            let chunk_size = unsafe { chunk.size() };
            let end = chunk.addr() + chunk_size;
            if chunk_size == 0 || end > brk {
                return Err(HeapError::MalformedChunk { addr: chunk.addr() });
            }
            size += chunk_size;
            if end == brk {
                return Ok(HeapLimit {
                    size,
                    heap_top_chunk: chunk.addr(),
                    heap_top_end: end,
                });
            }
            // SAFETY: end < brk, so the next header is mapped.
            chunk = unsafe { chunk.next() };
        }
    }

    /// One line per chunk across every reachable arena, plus totals. A
    /// best-effort snapshot: concurrent allocation can truncate it.
    pub fn dump_footprint<W: Write>(&self, w: &mut W) -> Result<Totals, HeapError> {
        let bottom = self.bottom()?;
        // SAFETY: the walk starts at a known chunk and every advance is
        // bounds-checked against the growth boundary or segment ends.
        unsafe { dump::write_footprint(w, bottom, growth_boundary(), self.main_arena) }
    }

    /// Framed per-chunk blocks for `start..heap_top_end`.
    ///
    /// # Safety
    ///
    /// The range must cover mapped heap memory; use
    /// [`HeapView::contiguous_heap_limit`] or a chunk address obtained from a
    /// live allocation to build it.
    pub unsafe fn dump_details<W: Write>(
        &self,
        w: &mut W,
        start: usize,
        heap_top_end: usize,
    ) -> Result<(), HeapError> {
        check_range(start, heap_top_end)?;
        let bottom = self.bottom()?;
        dump::write_details(
            w,
            Chunk::at(start),
            heap_top_end,
            growth_boundary(),
            self.main_arena,
            bottom,
        )
    }

    /// Word-by-word hex dump of `start..end`, capped at `max_kb` kibibytes
    /// when nonzero.
    ///
    /// # Safety
    ///
    /// As [`HeapView::dump_details`].
    pub unsafe fn dump_hex<W: Write>(
        &self,
        w: &mut W,
        start: usize,
        end: usize,
        max_kb: u32,
    ) -> Result<(), HeapError> {
        check_range(start, end)?;
        hex::hex_dump_range(w, start, end, max_kb)?;
        Ok(())
    }

    /// Verbatim bytes of `start..end`, capped at `max_kb` kibibytes when
    /// nonzero.
    ///
    /// # Safety
    ///
    /// As [`HeapView::dump_details`].
    pub unsafe fn dump_raw<W: Write>(
        &self,
        w: &mut W,
        start: usize,
        end: usize,
        max_kb: u32,
    ) -> Result<(), HeapError> {
        check_range(start, end)?;
        hex::raw_dump_range(w, start, end, max_kb)?;
        Ok(())
    }
}

fn check_range(start: usize, end: usize) -> Result<(), HeapError> {
    if start == 0 || end == 0 {
        return Err(HeapError::InvalidRange("null address"));
    }
    if start >= end {
        return Err(HeapError::InvalidRange("start is not below end"));
    }
    Ok(())
}

/// [`HeapView::dump_footprint`] of the global view, to stdout.
pub fn dump_footprint() -> Result<Totals, HeapError> {
    try_get()?.dump_footprint(&mut io::stdout().lock())
}

/// [`HeapView::dump_details`] of the global view, to stdout.
///
/// # Safety
///
/// As [`HeapView::dump_details`].
pub unsafe fn dump_details(start: usize, heap_top_end: usize) -> Result<(), HeapError> {
    try_get()?.dump_details(&mut io::stdout().lock(), start, heap_top_end)
}

/// [`HeapView::dump_hex`] of the global view, to stdout.
///
/// # Safety
///
/// As [`HeapView::dump_details`].
pub unsafe fn dump_hex(start: usize, end: usize, max_kb: u32) -> Result<(), HeapError> {
    try_get()?.dump_hex(&mut io::stdout().lock(), start, end, max_kb)
}

/// [`HeapView::dump_raw`] of the global view, to stdout.
///
/// # Safety
///
/// As [`HeapView::dump_details`].
pub unsafe fn dump_raw(start: usize, end: usize, max_kb: u32) -> Result<(), HeapError> {
    try_get()?.dump_raw(&mut io::stdout().lock(), start, end, max_kb)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Everything touching the global view lives in this one test so the
    // before/after-init ordering cannot race with a sibling test.
    #[test]
    fn the_global_view_initializes_exactly_once() {
        assert!(matches!(try_get(), Err(HeapError::NotInitialized)));
        assert!(matches!(
            dump_footprint(),
            Err(HeapError::NotInitialized)
        ));

        let first = init(false) as *const HeapView;
        let second = init(true) as *const HeapView;
        assert_eq!(first, second);

        let view = try_get().expect("initialized above");
        let mb = view.memory_bounds();
        assert_ne!(mb.heap_bottom_chunk, 0);
        assert!(mb.heap_bottom_chunk < mb.stack_top);
        assert!(mb.stack_top < mb.max_user_addr);
        assert!(mb.max_user_addr < mb.max_addr);

        // Other test threads allocate concurrently, so the contiguous walk
        // may legitimately catch a header mid-update; it must still return.
        match view.contiguous_heap_limit() {
            Ok(limit) => {
                assert!(limit.size > 0);
                assert!(limit.heap_top_chunk >= mb.heap_bottom_chunk);
                assert!(limit.heap_top_end > limit.heap_top_chunk);
            }
            Err(HeapError::MalformedChunk { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }

        assert!(matches!(
            unsafe { view.dump_hex(&mut Vec::new(), 0, 0x1000, 0) },
            Err(HeapError::InvalidRange(_))
        ));
        assert!(matches!(
            unsafe { view.dump_raw(&mut Vec::new(), 0x2000, 0x1000, 0) },
            Err(HeapError::InvalidRange(_))
        ));
    }
}
