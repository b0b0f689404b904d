//! Look at the glibc heap from inside the process it serves -- without asking
//! glibc.
//!
//! glibc's malloc publishes no handle to its arenas, heap segments or chunks,
//! so everything here is inferred: the main arena is discovered by a one-shot
//! probe thread that allocates from a *thread* arena and works backwards from
//! the heap-segment header it lands in, and every later walk interprets the
//! well-known (but undocumented) chunk header layout directly.
//!
//! Two things follow from that and are worth keeping in mind:
//!
//! - Every dump is a **best-effort snapshot**. We take no allocator lock, so
//!   another thread can mutate a chunk header mid-read. Walks detect the
//!   resulting nonsense (zero sizes, overruns) and stop, they do not crash.
//! - [`init()`] wants to run **before any other allocation** in the process,
//!   or the recorded heap-bottom chunk will not actually be the bottom. This
//!   is a documented contract, not something we can enforce.
//!
//! Nothing in this crate ever mutates allocator state.

pub mod arch;
pub mod dump;
pub mod error;
pub mod malloc;
pub mod util;
mod view;

pub use error::HeapError;
pub use view::{
    dump_details, dump_footprint, dump_hex, dump_raw, init, try_get, HeapLimit, HeapView,
    MemoryBounds,
};
