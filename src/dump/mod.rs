//! The heap walks behind every dump format.
//!
//! All walks share one shape: start at a heap's bottom chunk, hop from chunk
//! to chunk by adding sizes, and when the top chunk is reached either move to
//! the arena's next segment or to the next arena. [`ArenaCursor`] owns that
//! advance logic; the format-specific functions only decide what to print per
//! chunk.
//!
//! Nothing here allocates while walking. Chunk lines go straight to the
//! writer and the segment-bottom table lives in the cursor.

pub mod hex;

use std::io::{self, Write};

use crate::arch::mem::read_bytes;
use crate::error::HeapError;
use crate::malloc::arena::{self, Arena};
use crate::malloc::chunk::Chunk;
use crate::malloc::finder::MainArena;
use crate::malloc::heap::{self, HeapSegment};
use crate::util::fmt::{human_size, human_unit, human_unit_short, printable};

/// Most segments one arena walk will track. Matches no glibc limit; it is
/// simply far more segments than any sane process accumulates.
pub const MAX_NUM_HEAPS: usize = 1024;

/// Byte totals accumulated by a footprint walk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Totals {
    pub heap_size: usize,
    pub used: usize,
    pub free: usize,
}

/// Walk state across segments and arenas. Created on the main arena; each
/// [`ArenaCursor::advance`] call is made at a top chunk and yields the bottom
/// chunk to continue from, or `None` when every arena is exhausted.
struct ArenaCursor {
    main: MainArena,
    current: Arena,
    bottoms: [usize; MAX_NUM_HEAPS],
    idx: usize,
    len: usize,
    /// Arena hops consumed so far; caps the whole walk, not one advance, so
    /// a corrupted list that cycles past the main arena still terminates.
    hops: usize,
    brk: usize,
    main_bottom: Chunk,
}

/// What an advance landed on.
enum Hop {
    /// Next segment of the same arena.
    NextSegment(Chunk),
    /// First segment of the next arena.
    NextArena(Chunk),
}

impl ArenaCursor {
    fn new(main: MainArena, brk: usize, main_bottom: Chunk) -> ArenaCursor {
        ArenaCursor {
            main,
            current: main.arena,
            bottoms: [0; MAX_NUM_HEAPS],
            idx: 0,
            len: 0,
            hops: 0,
            brk,
            main_bottom,
        }
    }

    /// # Safety
    ///
    /// Arena structs and segment headers reachable from the main arena must
    /// be mapped readable.
    unsafe fn advance(&mut self) -> Option<Hop> {
        self.idx += 1;
        if self.idx < self.len {
            return Some(Hop::NextSegment(Chunk::at(self.bottoms[self.idx])));
        }
        // Current arena exhausted; move on, skipping arenas whose segments
        // cannot be recovered.
        while self.hops < arena::MAX_ARENA_WALK {
            self.hops += 1;
            self.current = arena::next_arena(self.current, self.main.arena, self.main.layout)?;
            self.idx = 0;
            self.len = heap::all_segment_bottoms(
                self.current.top(self.main.layout),
                self.brk,
                self.main_bottom,
                &mut self.bottoms,
            );
            if self.len > 0 {
                return Some(Hop::NextArena(Chunk::at(self.bottoms[0])));
            }
        }
        None
    }
}

/// Walk every arena and print one line per chunk plus a stack/heap summary
/// picture. Returns the accumulated totals, which always satisfy
/// `used + free == heap_size`.
///
/// With `main == None` (arena discovery failed) only the contiguous main
/// heap from `heap_bottom` to `brk` is walked.
///
/// # Safety
///
/// `heap_bottom` must be a real chunk header and every heap reachable from
/// the main arena must be mapped readable.
pub unsafe fn write_footprint<W: Write>(
    w: &mut W,
    heap_bottom: Chunk,
    brk: usize,
    main: Option<MainArena>,
) -> Result<Totals, HeapError> {
    let mut totals = Totals::default();
    let mut cursor = main.map(|m| ArenaCursor::new(m, brk, heap_bottom));
    let mut chunk = heap_bottom;
    // End of the heap currently being walked: brk for the main heap, the
    // segment end after a hop. A torn size word must not carry us past it.
    let mut end = brk;

    writeln!(w, "--------- MAIN ARENA: ---------")?;
    writeln!(w)?;
    loop {
        let size = chunk.size();
        if size == 0 || chunk.addr() + size > end {
            writeln!(w, "ERROR - bad chunk at {:#x}", chunk.addr())?;
            return Err(HeapError::MalformedChunk { addr: chunk.addr() });
        }
        totals.heap_size += size;

        if chunk.is_top(brk) {
            totals.free += size;
            writeln!(
                w,
                "{:>#14x}  * !HEAP TOP CHUNK! * {:>10} bytes FREE",
                chunk.addr(),
                size
            )?;
            match cursor.as_mut().and_then(|c| c.advance()) {
                Some(Hop::NextSegment(next)) => {
                    end = heap::heap_end(next, brk).unwrap_or(end);
                    writeln!(w)?;
                    chunk = next;
                    continue;
                }
                Some(Hop::NextArena(next)) => {
                    end = heap::heap_end(next, brk).unwrap_or(end);
                    writeln!(w)?;
                    writeln!(w, "--------- NEXT ARENA: ---------")?;
                    writeln!(w)?;
                    chunk = next;
                    continue;
                }
                None => break,
            }
        }

        let in_use = chunk.is_in_use(brk);
        writeln!(
            w,
            "{:>#14x}  mem: {:>#14x}  {:>10} bytes {}",
            chunk.addr(),
            chunk.mem_ptr(),
            size,
            if in_use { "USED" } else { "FREE" }
        )?;
        if in_use {
            totals.used += size;
        } else {
            totals.free += size;
        }
        chunk = chunk.next();
    }

    writeln!(w)?;
    writeln!(w, "                 +--------------------------+ STACK TOP")?;
    writeln!(w, "                 |          STACK           |")?;
    writeln!(w, "                 +---||------||-------||----+")?;
    writeln!(w, "                 |   \\/      \\/       \\/    |")?;
    writeln!(w, "                 |        Free Space        |")?;
    writeln!(w, "                 |   /\\      /\\       /\\    |")?;
    writeln!(w, "                 +---||------||-------||----+")?;
    writeln!(w, "                 |                          |")?;
    writeln!(w, "                 |          HEAP            |")?;
    writeln!(
        w,
        "                 | {:>10} {} size       |",
        human_size(totals.heap_size),
        human_unit_short(totals.heap_size)
    )?;
    writeln!(w, "                 |                          |")?;
    writeln!(
        w,
        "                 | {:>10} {} used       |",
        human_size(totals.used),
        human_unit_short(totals.used)
    )?;
    writeln!(
        w,
        "                 | {:>10} {} free       |",
        human_size(totals.free),
        human_unit_short(totals.free)
    )?;
    writeln!(w, "                 |                          |")?;
    writeln!(
        w,
        "{:>#16x} +--------------------------+ HEAP BOTTOM",
        heap_bottom.addr()
    )?;
    writeln!(w)?;
    Ok(totals)
}

/// One chunk as a framed block: header bytes, size and flags, then either a
/// payload preview (in use) or the free-list links (free).
///
/// # Safety
///
/// The chunk header, its next chunk's header, and the first 16 payload bytes
/// must be mapped readable.
pub unsafe fn write_chunk<W: Write>(w: &mut W, chunk: Chunk, brk: usize) -> io::Result<()> {
    let size = chunk.size();
    let is_top = chunk.is_top(brk);
    let in_use = chunk.is_in_use(brk);
    let payload = chunk.payload_size();
    let overhead = chunk.overhead().to_be_bytes();

    writeln!(w, "{:>#14x} +-----------------------------------", chunk.addr())?;
    writeln!(
        w,
        "   {} | {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X}",
        if is_top { "(TOP CHUNK)" } else { "           " },
        overhead[0],
        overhead[1],
        overhead[2],
        overhead[3],
        overhead[4],
        overhead[5],
        overhead[6],
        overhead[7]
    )?;
    writeln!(w, "               +-----------------------------------")?;
    writeln!(
        w,
        "               | chunk_size = {} {} | AMP = {:X}{:X}{:X}",
        human_size(size),
        human_unit(size),
        chunk.in_thread_arena() as u8,
        chunk.is_mmapped() as u8,
        chunk.prev_in_use() as u8
    )?;
    writeln!(w, "               +-----------------------------------")?;

    if in_use {
        let preview_lines = if payload >= 16 { 2 } else { 1 };
        for line in 0..preview_lines {
            let mut bytes = [0u8; 8];
            read_bytes(&mut bytes, chunk.mem_ptr() + line * 8);
            writeln!(
                w,
                "               | {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} | \
                 {}{}{}{}{}{}{}{}",
                bytes[0],
                bytes[1],
                bytes[2],
                bytes[3],
                bytes[4],
                bytes[5],
                bytes[6],
                bytes[7],
                printable(bytes[0]),
                printable(bytes[1]),
                printable(bytes[2]),
                printable(bytes[3]),
                printable(bytes[4]),
                printable(bytes[5]),
                printable(bytes[6]),
                printable(bytes[7])
            )?;
        }
        writeln!(w, "               | ...")?;
        writeln!(w, "               |")?;
        writeln!(
            w,
            "               | USED ({} {}{}{})",
            human_size(payload),
            human_unit(payload),
            if chunk.is_mmapped() { " mmap() memory" } else { "" },
            if chunk.in_thread_arena() { " in thread arena" } else { "" }
        )?;
        writeln!(w, "               |")?;
    } else {
        writeln!(w, "               | next_free = {:#x}", chunk.next_free())?;
        writeln!(w, "               +-----------------------------------")?;
        writeln!(w, "               | prev_free = {:#x}", chunk.prev_free())?;
        writeln!(w, "               +-----------------------------------")?;
        writeln!(w, "               |")?;
        writeln!(
            w,
            "               | FREE ({} {})",
            human_size(payload),
            human_unit(payload)
        )?;
        writeln!(w, "               |")?;
        if is_top {
            let end = chunk.addr() + size;
            if end == crate::malloc::growth_boundary() {
                writeln!(w, "{:>#14x} +---------- TOP = sbrk(0) ----------", end)?;
            } else {
                writeln!(w, "{:>#14x} +-------------- TOP ----------------", end)?;
            }
        }
    }
    Ok(())
}

/// The `heap_info` header of the segment holding `chunk`, framed like
/// [`write_chunk`].
///
/// # Safety
///
/// `chunk` must lie in a mapped thread-heap segment.
pub unsafe fn write_heap_info<W: Write>(w: &mut W, chunk: Chunk) -> io::Result<()> {
    let seg = HeapSegment::containing(chunk.addr());
    writeln!(w, "{:>#14x} +========== HEAP INFO ==============", seg.base())?;
    writeln!(w, "               | ar_ptr = {:#x}", seg.arena_ptr())?;
    writeln!(w, "               +-----------------------------------")?;
    writeln!(
        w,
        "               | prev = {:#x}",
        seg.prev().map_or(0, HeapSegment::base)
    )?;
    writeln!(w, "               +-----------------------------------")?;
    writeln!(w, "               | size = {} -> top = {:#x}", seg.size(), seg.end())?;
    writeln!(w, "               +-----------------------------------")?;
    writeln!(w, "               | ...")?;
    writeln!(w, "               +===================================")?;
    Ok(())
}

/// Walk from `start` to `heap_top_end` printing every chunk as a framed
/// block, continuing across segments and arenas like the footprint walk.
///
/// # Safety
///
/// As [`write_footprint`], plus `start..heap_top_end` must be mapped.
pub unsafe fn write_details<W: Write>(
    w: &mut W,
    start: Chunk,
    mut heap_top_end: usize,
    brk: usize,
    main: Option<MainArena>,
    heap_bottom: Chunk,
) -> Result<(), HeapError> {
    // Name the starting arena, so thread-heap dumps are not mistaken for
    // main-heap ones.
    let starting_arena = main.and_then(|m| arena::owning_arena(start, m.arena, m.layout));
    match (main, starting_arena) {
        (Some(m), Some(ar)) if ar == m.arena => {
            writeln!(w, "--------- MAIN ARENA at {:#x}:", m.arena.base())?;
            writeln!(w)?;
            writeln!(w, "          HEAP at {:#x}:", heap_bottom.addr())?;
            writeln!(w)?;
        }
        (_, Some(ar)) => {
            let seg = HeapSegment::containing(start.addr());
            writeln!(w, "--------- ALLOCATED ARENA at {:#x}:", ar.base())?;
            writeln!(w)?;
            writeln!(w, "          HEAP at {:#x}:", seg.base())?;
            writeln!(w)?;
            write_heap_info(w, start)?;
        }
        _ => {
            writeln!(w, "--------- MAIN ARENA:")?;
            writeln!(w)?;
        }
    }

    let mut cursor = main.map(|m| ArenaCursor::new(m, brk, heap_bottom));
    if let (Some(c), Some(ar)) = (cursor.as_mut(), starting_arena) {
        // Resume the arena iteration from where the range starts.
        c.current = ar;
    }
    let mut chunk = start;
    loop {
        if chunk.addr() >= heap_top_end {
            break;
        }
        let size = chunk.size();
        if size == 0 || chunk.addr() + size > heap_top_end {
            writeln!(w, "ERROR - bad chunk at {:#x}", chunk.addr())?;
            return Err(HeapError::MalformedChunk { addr: chunk.addr() });
        }

        write_chunk(w, chunk, brk)?;

        if chunk.is_top(brk) {
            match cursor.as_mut().and_then(|c| c.advance()) {
                Some(Hop::NextSegment(next)) => {
                    heap_top_end = heap::heap_end(next, brk).unwrap_or(heap_top_end);
                    let seg = HeapSegment::containing(next.addr());
                    writeln!(w)?;
                    writeln!(w, "          HEAP at {:#x}:", seg.base())?;
                    writeln!(w)?;
                    write_heap_info(w, next)?;
                    chunk = next;
                    continue;
                }
                Some(Hop::NextArena(next)) => {
                    heap_top_end = heap::heap_end(next, brk).unwrap_or(heap_top_end);
                    let owner = cursor.as_ref().map(|c| c.current.base()).unwrap_or(0);
                    let seg = HeapSegment::containing(next.addr());
                    writeln!(w)?;
                    writeln!(w, "--------- ALLOCATED ARENA at {:#x}:", owner)?;
                    writeln!(w)?;
                    writeln!(w, "          HEAP at {:#x}:", seg.base())?;
                    writeln!(w)?;
                    write_heap_info(w, next)?;
                    chunk = next;
                    continue;
                }
                None => break,
            }
        }
        chunk = chunk.next();
    }
    writeln!(w)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::{PREV_INUSE, SIZE_SZ};

    // |used 64|free 48|used 32|top 112|, brk at the buffer's end.
    fn synthetic_heap() -> (Vec<usize>, Chunk, usize) {
        let mut buf = vec![0usize; 256 / SIZE_SZ];
        let base = buf.as_ptr() as usize;
        buf[1] = 64 | PREV_INUSE;
        buf[64 / SIZE_SZ + 1] = 48 | PREV_INUSE;
        buf[112 / SIZE_SZ] = 48;
        buf[112 / SIZE_SZ + 1] = 32;
        buf[144 / SIZE_SZ + 1] = 112 | PREV_INUSE;
        (buf, Chunk::at(base), base + 256)
    }

    #[test]
    fn footprint_totals_are_conserved() {
        let (_buf, bottom, brk) = synthetic_heap();
        let mut out = Vec::new();
        let totals = unsafe { write_footprint(&mut out, bottom, brk, None).unwrap() };
        assert_eq!(totals.heap_size, 256);
        assert_eq!(totals.used + totals.free, totals.heap_size);
        assert_eq!(totals.used, 64 + 32);
        assert_eq!(totals.free, 48 + 112);
    }

    #[test]
    fn footprint_lines_name_every_chunk_state() {
        let (_buf, bottom, brk) = synthetic_heap();
        let mut out = Vec::new();
        unsafe { write_footprint(&mut out, bottom, brk, None).unwrap() };
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("--------- MAIN ARENA: ---------"), "{text}");
        assert!(text.contains("* !HEAP TOP CHUNK! *"), "{text}");
        assert_eq!(text.matches("bytes USED").count(), 2, "{text}");
        assert_eq!(text.matches("bytes FREE").count(), 2, "{text}");
        assert!(text.contains("HEAP BOTTOM"), "{text}");
    }

    // |used 32|used 48|used 64|used 32|top 80|, brk at the buffer's end.
    fn four_used_heap() -> (Vec<usize>, Chunk, usize) {
        let mut buf = vec![0usize; 256 / SIZE_SZ];
        let base = buf.as_ptr() as usize;
        buf[1] = 32 | PREV_INUSE;
        buf[32 / SIZE_SZ + 1] = 48 | PREV_INUSE;
        buf[80 / SIZE_SZ + 1] = 64 | PREV_INUSE;
        buf[144 / SIZE_SZ + 1] = 32 | PREV_INUSE;
        buf[176 / SIZE_SZ + 1] = 80 | PREV_INUSE;
        (buf, Chunk::at(base), base + 256)
    }

    #[test]
    fn four_used_chunks_under_the_top_are_each_reported() {
        let (_buf, bottom, brk) = four_used_heap();
        let mut out = Vec::new();
        let totals = unsafe { write_footprint(&mut out, bottom, brk, None).unwrap() };
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("bytes USED").count(), 4, "{text}");
        assert_eq!(text.matches("!HEAP TOP CHUNK!").count(), 1, "{text}");
        assert_eq!(text.matches("bytes FREE").count(), 1, "{text}");
        assert_eq!(totals.used, 32 + 48 + 64 + 32);
        assert_eq!(totals.free, 80);
        assert_eq!(totals.used + totals.free, totals.heap_size);
        assert_eq!(totals.heap_size, brk - bottom.addr());
    }

    #[test]
    fn a_zero_size_chunk_aborts_the_walk() {
        let buf = vec![0usize; 8];
        let bottom = Chunk::at(buf.as_ptr() as usize);
        let brk = bottom.addr() + 64;
        let mut out = Vec::new();
        let err = unsafe { write_footprint(&mut out, bottom, brk, None) };
        assert!(matches!(err, Err(HeapError::MalformedChunk { .. })));
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ERROR - bad chunk at"), "{text}");
    }

    #[test]
    fn a_chunk_overrunning_the_heap_end_aborts_the_walk() {
        // A size word that would step past the growth boundary.
        let mut buf = vec![0usize; 8];
        buf[1] = 512 | PREV_INUSE;
        let bottom = Chunk::at(buf.as_ptr() as usize);
        let brk = bottom.addr() + 64;
        let mut out = Vec::new();
        let err = unsafe { write_footprint(&mut out, bottom, brk, None) };
        assert!(matches!(err, Err(HeapError::MalformedChunk { .. })));
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ERROR - bad chunk at"), "{text}");
    }

    #[test]
    fn details_stop_at_an_overrunning_chunk() {
        let mut buf = vec![0usize; 8];
        buf[1] = 512 | PREV_INUSE;
        let bottom = Chunk::at(buf.as_ptr() as usize);
        let end = bottom.addr() + 64;
        let mut out = Vec::new();
        let err = unsafe { write_details(&mut out, bottom, end, end, None, bottom) };
        assert!(matches!(err, Err(HeapError::MalformedChunk { .. })));
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ERROR - bad chunk at"), "{text}");
    }

    #[test]
    fn chunk_blocks_show_state_and_flags() {
        let (_buf, bottom, brk) = synthetic_heap();
        let mut out = Vec::new();
        unsafe {
            write_details(&mut out, bottom, brk, brk, None, bottom).unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("chunk_size = 64 BYTES | AMP = 001"), "{text}");
        assert!(text.contains("| USED (48 BYTES)"), "{text}");
        assert!(text.contains("next_free ="), "{text}");
        assert!(text.contains("(TOP CHUNK)"), "{text}");
        assert!(text.contains("+-------------- TOP ----------------"), "{text}");
    }

    #[test]
    fn heap_info_block_decodes_the_segment_header() {
        let fx = crate::malloc::fixture::FakeArenas::build();
        let mut out = Vec::new();
        unsafe {
            write_heap_info(
                &mut out,
                Chunk::at(fx.new_seg + crate::malloc::fixture::NEW_FIRST_CHUNK),
            )
            .unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("HEAP INFO"), "{text}");
        assert!(text.contains(&format!("ar_ptr = {:#x}", fx.thread_arena)), "{text}");
        assert!(text.contains(&format!("prev = {:#x}", fx.old_seg)), "{text}");
        assert!(
            text.contains(&format!("size = 2048 -> top = {:#x}", fx.new_seg + 2048)),
            "{text}"
        );
    }
}
