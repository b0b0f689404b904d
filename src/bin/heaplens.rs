//! Command-line front end: initialize the heap view before anything that
//! allocates and keeps the memory. The logger leaks its box and clap keeps
//! the parsed arguments alive, so both run after `init`; only the verbose
//! flag is sniffed from the raw arguments first, retaining nothing. `init`'s
//! own narration is dropped (no logger exists yet) and replayed from the
//! built view afterwards.

use std::io::{self, Write};

use clap::Parser;

use heaplens::{HeapError, HeapLimit, MemoryBounds};

#[derive(Parser, Debug)]
#[command(name = "heaplens", version, about = "Dump the glibc heap of this process")]
struct Cli {
    /// Narrate discovery and dump steps.
    #[arg(short, long)]
    verbose: bool,

    /// Allocate this many MiB (spread over a few blocks) before dumping, to
    /// give the dump something to show.
    #[arg(long, value_name = "MB")]
    alloc_mb: Option<f64>,

    /// One line per chunk across every arena, plus totals.
    #[arg(long)]
    footprint: bool,

    /// Framed per-chunk blocks of the main heap.
    #[arg(long)]
    details: bool,

    /// Word-by-word hex dump of the main heap.
    #[arg(long)]
    hex: bool,

    /// Verbatim bytes of the main heap.
    #[arg(long)]
    raw: bool,

    /// Stop hex/raw output after this many KiB (0 = unlimited).
    #[arg(long, value_name = "KB", default_value_t = 0)]
    max_kb: u32,
}

/// Blocks the ballast allocation is split into.
const NUM_BALLAST_BLOCKS: usize = 4;

fn main() {
    let verbose = verbose_requested(std::env::args());

    // Before the logger and before clap: anything allocated and kept at this
    // point would sit below the recorded heap bottom and hide the lowest
    // chunks from every walk.
    let view = heaplens::init(verbose);

    let mut builder = env_logger::Builder::from_default_env();
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
    if verbose {
        narrate_bootstrap(view);
    }

    let cli = Cli::parse();
    if cli.max_kb != 0 && !cli.hex && !cli.raw {
        eprintln!("error: --max-kb only applies to --hex and --raw");
        std::process::exit(2);
    }

    // Kept alive until after the dump so it shows up in the output.
    let _ballast = cli.alloc_mb.map(|mb| allocate_ballast(mb, cli.verbose));

    if let Err(e) = run(view, &cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

/// Does the raw argument list ask for verbose output? Runs before clap;
/// nothing parsed here is kept.
fn verbose_requested<I>(args: I) -> bool
where
    I: IntoIterator<Item = String>,
{
    args.into_iter().any(|a| a == "-v" || a == "--verbose")
}

/// Replay what `init` discovered. No logger existed while `init` ran, so its
/// narration was dropped; the facts survive in the view.
fn narrate_bootstrap(view: &heaplens::HeapView) {
    let mb = view.memory_bounds();
    log::info!(
        "address space: max {:#x}, user {:#x}, stack top {:#x}",
        mb.max_addr,
        mb.max_user_addr,
        mb.stack_top
    );
    log::info!("heap bottom chunk at {:#x}", mb.heap_bottom_chunk);
    match view.main_arena() {
        Some(m) => log::info!("main arena at {:#x}", m.arena.base()),
        None => log::warn!("main arena not found; dumps cover the main heap only"),
    }
}

fn allocate_ballast(mb: f64, verbose: bool) -> Vec<Vec<u8>> {
    let total = (mb * 1024.0 * 1024.0) as usize;
    let block = total / NUM_BALLAST_BLOCKS;
    if block == 0 {
        return Vec::new();
    }
    if verbose {
        println!("ALLOCATING {mb:.6} MB in MAIN ARENA ({NUM_BALLAST_BLOCKS} chunks)...");
    }
    (0..NUM_BALLAST_BLOCKS).map(|_| vec![0u8; block]).collect()
}

fn run(view: &heaplens::HeapView, cli: &Cli) -> Result<(), HeapError> {
    let bounds = view.memory_bounds();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if cli.footprint {
        if cli.verbose {
            writeln!(out, "Dumping the HEAP footprint...")?;
        }
        writeln!(out)?;
        view.dump_footprint(&mut out)?;
        return Ok(());
    }

    // Every remaining mode walks the contiguous main heap.
    let limit = view.contiguous_heap_limit()?;

    if cli.details {
        if cli.verbose {
            writeln!(out, "DEBUG dump of the HEAP...")?;
        }
        writeln!(out)?;
        // SAFETY: the range comes from the contiguous-heap walk just above.
        unsafe {
            view.dump_details(&mut out, bounds.heap_bottom_chunk, limit.heap_top_end)?;
        }
        return Ok(());
    }
    if cli.hex {
        if cli.verbose {
            if cli.max_kb != 0 {
                writeln!(out, "HEX dump of the HEAP (max: {} KB)...", cli.max_kb)?;
            } else {
                writeln!(out, "HEX dump of the HEAP...")?;
            }
        }
        writeln!(out)?;
        // SAFETY: as above.
        unsafe {
            view.dump_hex(&mut out, bounds.heap_bottom_chunk, limit.heap_top_end, cli.max_kb)?;
        }
        return Ok(());
    }
    if cli.raw {
        if cli.verbose {
            if cli.max_kb != 0 {
                writeln!(out, "RAW dump of the HEAP (max: {} KB)...", cli.max_kb)?;
            } else {
                writeln!(out, "RAW dump of the HEAP...")?;
            }
        }
        writeln!(out)?;
        // SAFETY: as above.
        unsafe {
            view.dump_raw(&mut out, bounds.heap_bottom_chunk, limit.heap_top_end, cli.max_kb)?;
        }
        return Ok(());
    }

    write_overview(&mut out, bounds, limit)?;
    Ok(())
}

/// The default mode: a box picture of the whole address space with the main
/// heap's measured size in the middle.
fn write_overview<W: Write>(w: &mut W, b: MemoryBounds, limit: HeapLimit) -> io::Result<()> {
    use heaplens::util::fmt::{human_size, human_unit_short};

    let (top_label, user_label) = if b.max_user_addr > 0xffff_ffff {
        ("256 TB", "128 TB")
    } else if b.max_user_addr == 0xbfff_ffff {
        ("4 GB", "3 GB")
    } else {
        ("4 GB", "2 GB")
    };

    // Rough lower edge of static data, to size the gap below the heap.
    static STATIC_PROBE: u8 = 1;
    let static_bottom = &STATIC_PROBE as *const u8 as usize;
    let static_size = b.heap_bottom_chunk.saturating_sub(static_bottom);

    writeln!(w)?;
    writeln!(
        w,
        "{:>#16x} +--------------------------+ ADDRESS SPACE TOP ({top_label})",
        b.max_addr
    )?;
    writeln!(w, "                 |                          |")?;
    writeln!(w, "                 |                          |")?;
    writeln!(w, "                 |      MAPPED KERNEL       |")?;
    writeln!(w, "                 |                          |")?;
    writeln!(w, "                 |                          |")?;
    writeln!(
        w,
        "{:>#16x} +--------------------------+ USER SPACE TOP ({user_label})",
        b.max_user_addr
    )?;
    writeln!(w, "                 |        Guard Page        |")?;
    writeln!(
        w,
        "{:>#16x} +--------------------------+ STACK TOP",
        b.stack_top
    )?;
    writeln!(w, "                 |          STACK           |")?;
    writeln!(w, "                 +---||------||-------||----+")?;
    writeln!(w, "                 |   \\/      \\/       \\/    |")?;
    writeln!(w, "                 |        Free Space        |")?;
    writeln!(w, "                 |   /\\      /\\       /\\    |")?;
    writeln!(
        w,
        "{:>#16x} +---||------||-------||----+ MAIN HEAP TOP",
        limit.heap_top_end
    )?;
    writeln!(w, "                 |                          |")?;
    writeln!(w, "                 |        MAIN HEAP         |")?;
    writeln!(
        w,
        "                 |   {:>10} {}          |",
        human_size(limit.size),
        human_unit_short(limit.size)
    )?;
    writeln!(w, "                 |                          |")?;
    writeln!(
        w,
        "{:>#16x} +--------------------------+ MAIN HEAP BOTTOM",
        b.heap_bottom_chunk
    )?;
    writeln!(w, "                 |                          |")?;
    writeln!(w, "                 |      STATIC MEMORY       |")?;
    writeln!(
        w,
        "                 |   {:>10} {}          |",
        human_size(static_size),
        human_unit_short(static_size)
    )?;
    writeln!(w, "                 |                          |")?;
    writeln!(
        w,
        "{:>#16x} +--------------------------+ STATIC DATA BOTTOM",
        static_bottom
    )?;
    writeln!(w, "                 |                          |")?;
    writeln!(w, "                 |          CODE            |")?;
    writeln!(w, "                 |         (TEXT)           |")?;
    writeln!(w, "                 |                          |")?;
    writeln!(w, "                 +--------------------------+ CODE BOTTOM")?;
    writeln!(w, "                 |                          |")?;
    writeln!(w, "             0x0 +--------------------------+ ADDRESS SPACE BOTTOM")?;
    writeln!(w)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn the_verbose_flag_is_sniffed_from_raw_arguments() {
        assert!(verbose_requested(args(&["heaplens", "-v", "--hex"])));
        assert!(verbose_requested(args(&["heaplens", "--verbose"])));
        assert!(!verbose_requested(args(&["heaplens", "--footprint"])));
        assert!(!verbose_requested(args(&["heaplens", "-verbose"])));
    }
}
