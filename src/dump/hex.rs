//! Hex and raw dumps of an address range.
//!
//! The hex dump prints one 8-byte word per line with a printable-character
//! gutter and the word's address range. Long runs of zero words dominate real
//! heaps, so a run of [`ZERO_RUN_COLLAPSE`] or more words is folded into a
//! one-line summary plus a single representative line. The raw dump writes
//! the bytes verbatim, suitable for piping into other tools.

use std::io::{self, Write};

use crate::arch::mem::{load_byte, load_word};
use crate::util::fmt::printable;

/// A zero run of at least this many words is summarized instead of printed.
pub const ZERO_RUN_COLLAPSE: usize = 9;

const WORD: usize = 8;

fn write_word_line<W: Write>(w: &mut W, addr: usize, bytes: [u8; WORD]) -> io::Result<()> {
    writeln!(
        w,
        "{:02X} {:02X} {:02X} {:02X}   {:02X} {:02X} {:02X} {:02X} | \
         {}{}{}{} {}{}{}{} {:>#14x} ... {:>#14x}",
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
        printable(bytes[7]),
        addr,
        addr + WORD - 1,
    )
}

/// Flush a pending zero run. Short runs are printed word by word; long runs
/// get the summary plus the run's last word as a representative line.
fn flush_zero_run<W: Write>(w: &mut W, run_start: usize, run: usize) -> io::Result<()> {
    if run == 0 {
        return Ok(());
    }
    if run < ZERO_RUN_COLLAPSE {
        for i in 0..run {
            write_word_line(w, run_start + i * WORD, [0; WORD])?;
        }
        return Ok(());
    }
    writeln!(
        w,
        "{} more zero words -> total zero block size: {} bytes",
        run - 1,
        run * WORD
    )?;
    write_word_line(w, run_start + (run - 1) * WORD, [0; WORD])
}

fn write_total<W: Write>(w: &mut W, bytes: usize) -> io::Result<()> {
    writeln!(w)?;
    if bytes < 100 * 1024 {
        writeln!(w, "TOTAL: {:5.3} KB", bytes as f64 / 1024.0)
    } else {
        writeln!(w, "TOTAL: {} KB", bytes / 1024)
    }
}

/// Hex-dump `start..end` to `w`, stopping after `max_kb` kibibytes when
/// `max_kb` is nonzero. Collapsed zero words still count toward the cap, so
/// the cap bounds the memory touched, not just the lines printed.
///
/// # Safety
///
/// `start..end` must be mapped readable and `start` word-aligned.
pub unsafe fn hex_dump_range<W: Write>(
    w: &mut W,
    start: usize,
    end: usize,
    max_kb: u32,
) -> io::Result<()> {
    let max_bytes = max_kb as usize * 1024;
    let mut processed = 0usize;
    let mut run_start = start;
    let mut run = 0usize;

    let mut addr = start;
    while addr + WORD <= end {
        if load_word(addr) == 0 {
            if run == 0 {
                run_start = addr;
            }
            run += 1;
        } else {
            flush_zero_run(w, run_start, run)?;
            run = 0;
            let mut bytes = [0u8; WORD];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = load_byte(addr + i);
            }
            write_word_line(w, addr, bytes)?;
        }

        addr += WORD;
        processed += WORD;
        if max_bytes != 0 && processed >= max_bytes {
            flush_zero_run(w, run_start, run)?;
            writeln!(w)?;
            writeln!(w, ">>> INTERRUPTED after {max_kb} KB <<<")?;
            writeln!(w)?;
            return Ok(());
        }
    }
    flush_zero_run(w, run_start, run)?;
    write_total(w, processed)?;
    writeln!(w)
}

/// Copy `start..end` to `w` byte for byte, stopping after `max_kb` kibibytes
/// when `max_kb` is nonzero.
///
/// # Safety
///
/// `start..end` must be mapped readable.
pub unsafe fn raw_dump_range<W: Write>(
    w: &mut W,
    start: usize,
    end: usize,
    max_kb: u32,
) -> io::Result<()> {
    let max_bytes = max_kb as usize * 1024;
    let mut buf = [0u8; 256];
    let mut addr = start;
    let mut written = 0usize;
    while addr < end {
        let take = buf.len().min(end - addr);
        let take = if max_bytes != 0 {
            take.min(max_bytes - written)
        } else {
            take
        };
        for (i, b) in buf[..take].iter_mut().enumerate() {
            *b = load_byte(addr + i);
        }
        w.write_all(&buf[..take])?;
        addr += take;
        written += take;
        if max_bytes != 0 && written >= max_bytes {
            break;
        }
    }
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump_to_string(words: &[usize], max_kb: u32) -> String {
        let start = words.as_ptr() as usize;
        let end = start + words.len() * core::mem::size_of::<usize>();
        let mut out = Vec::new();
        unsafe { hex_dump_range(&mut out, start, end, max_kb).unwrap() };
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn nonzero_words_print_one_line_each() {
        let words = [0x4141_4141_4141_4141usize, 0x42usize];
        let text = dump_to_string(&words, 0);
        assert!(text.contains("41 41 41 41   41 41 41 41 | AAAA AAAA"));
        assert!(text.contains("42 00 00 00   00 00 00 00 | B... ...."));
        assert!(text.contains("TOTAL: 0.016 KB"), "{text}");
    }

    #[test]
    fn a_long_zero_run_collapses_to_summary_and_representative() {
        // 10 zero words between two markers.
        let mut words = [0usize; 12];
        words[0] = 0x11;
        words[11] = 0x22;
        let text = dump_to_string(&words, 0);
        assert!(
            text.contains("9 more zero words -> total zero block size: 80 bytes"),
            "{text}"
        );
        // Exactly one zero line survives as the representative.
        let zero_lines = text
            .lines()
            .filter(|l| l.starts_with("00 00 00 00   00 00 00 00"))
            .count();
        assert_eq!(zero_lines, 1, "{text}");
    }

    #[test]
    fn a_short_zero_run_prints_literally() {
        let mut words = [0usize; 6];
        words[0] = 0x11;
        words[5] = 0x22;
        let text = dump_to_string(&words, 0);
        assert!(!text.contains("more zero words"), "{text}");
        let zero_lines = text
            .lines()
            .filter(|l| l.starts_with("00 00 00 00   00 00 00 00"))
            .count();
        assert_eq!(zero_lines, 4, "{text}");
    }

    #[test]
    fn the_kb_cap_interrupts_the_dump() {
        let words = vec![0x5a5a_5a5a_5a5a_5a5ausize; 512]; // 4 KB
        let text = dump_to_string(&words, 1);
        assert!(text.contains(">>> INTERRUPTED after 1 KB <<<"), "{text}");
        assert!(!text.contains("TOTAL:"), "{text}");
        let data_lines = text
            .lines()
            .filter(|l| l.starts_with("5A 5A 5A 5A"))
            .count();
        assert_eq!(data_lines, 1024 / 8, "{text}");
    }

    #[test]
    fn raw_dump_is_verbatim_and_capped() {
        let bytes = vec![0xa5u8; 4096];
        let start = bytes.as_ptr() as usize;
        let mut out = Vec::new();
        unsafe { raw_dump_range(&mut out, start, start + bytes.len(), 0).unwrap() };
        assert_eq!(out, bytes);

        let mut capped = Vec::new();
        unsafe { raw_dump_range(&mut capped, start, start + bytes.len(), 1).unwrap() };
        assert_eq!(capped.len(), 1024);
    }
}
