//! Error types for cache operations.

use kiln_common::InternalError;
use kiln_mem::{AllocError, SlotError};
use std::path::PathBuf;

/// Errors that can occur while compiling or persisting a kernel.
///
/// Loading never produces a `CacheError`: every load failure is reported as a
/// [`Miss`](crate::Miss) so the caller falls back to compiling.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while writing a cache file.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The kernel lives at an OS-chosen address and cannot be mapped back.
    #[error("kernel is not in a fixed slot and cannot be cached")]
    NotCacheable,

    /// A value does not fit the 32-bit fields of the metadata format.
    #[error("{what} ({value}) exceeds the metadata format's 32-bit limit")]
    TooLarge {
        /// What overflowed.
        what: &'static str,
        /// The offending value.
        value: u64,
    },

    /// Reserving a slot failed.
    #[error(transparent)]
    Slot(#[from] SlotError),

    /// The region allocator rejected an operation.
    #[error(transparent)]
    Alloc(#[from] AllocError),

    /// The code generator failed.
    #[error("code generation failed: {0}")]
    Generator(#[from] InternalError),
}
