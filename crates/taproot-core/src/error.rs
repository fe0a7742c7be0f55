//! Error types for all taproot operations.

use std::io;
use thiserror::Error;

/// Top-level error type for tree, index, and bulk-load operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk key/value/page geometry disagrees with the opened instantiation.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("signature mismatch: file carries {found:#018x}, caller expects {expected:#018x}")]
    SignatureMismatch { expected: u64, found: u64 },

    /// Malformed header, corrupt node, or an inconsistent free list.
    #[error("format error: {0}")]
    Format(String),

    /// Every cached page is pinned; the working set cannot be admitted.
    #[error("page cache exhausted: all {capacity} pages pinned")]
    CacheExhausted { capacity: usize },

    /// The configured cache cannot hold the pin set of a single operation.
    #[error("cache capacity {configured} is below the required minimum of {required} pages")]
    CacheTooSmall { required: usize, configured: usize },

    #[error("invalid iterator: {0}")]
    InvalidIterator(&'static str),

    /// Programmer misuse: double free, unknown flag bits, writes on a
    /// read-only tree.
    #[error("logic error: {0}")]
    Logic(String),

    #[error("file is locked by another writer")]
    FileLocked,
}

pub type Result<T> = std::result::Result<T, Error>;
