//! Everything here is local and recoverable: the worst outcome anywhere in
//! this crate is a partial or empty dump plus a diagnostic.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeapError {
    /// Bounds or dumps were queried before [`crate::init()`] completed.
    #[error("heap view is not initialized; call init() first")]
    NotInitialized,

    /// The bootstrap probe could not locate the main arena. Arena-spanning
    /// operations limit themselves to the main heap.
    #[error("the main arena could not be located; only the main heap is reachable")]
    ArenaNotFound,

    /// A walk decoded a zero or otherwise implausible chunk size. Only the
    /// current walk stops.
    #[error("implausible chunk header at {addr:#x}")]
    MalformedChunk { addr: usize },

    /// A dump was asked for a missing or inverted address range.
    #[error("invalid dump range: {0}")]
    InvalidRange(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
