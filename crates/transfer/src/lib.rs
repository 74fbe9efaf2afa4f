//! Chunked transfer primitives for the upload pipeline.
//!
//! - [`ContentHasher`]: streaming XXH3-128 content fingerprint.
//! - [`ChunkReader`]: reads 1-based parts of a local file.
//! - [`RetryPolicy`]: bounded retry with exponential backoff.
//! - [`ChunkProgress`]: aggregates per-part progress into a percentage.

mod chunked;
mod hasher;
mod progress;
mod retry;
mod validation;

pub use chunked::{ChunkReader, part_len, part_range, total_chunks};
pub use hasher::{ContentHasher, digest_bytes};
pub use progress::ChunkProgress;
pub use retry::{RetryError, RetryPolicy};
pub use validation::{check_file_name, folder_segments, leaf_name};

/// Client-side chunk size guess (7 MiB), used only until the server answers
/// session init with its own value.
pub const DEFAULT_CHUNK_SIZE: u64 = 7 * 1024 * 1024;

/// Files at or below this size (90 MiB) go through the single-request path.
pub const SMALL_FILE_THRESHOLD: u64 = 90 * 1024 * 1024;

/// Files above this size (1 GiB) are not hashed.
pub const HASH_SIZE_CEILING: u64 = 1024 * 1024 * 1024;

/// Slice size fed to the hasher per step (2 MiB).
pub const HASH_SLICE_SIZE: usize = 2 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("restricted file type: {0}")]
    RestrictedType(String),

    #[error("part {part} out of range (1..={total})")]
    PartOutOfRange { part: u32, total: u32 },
}
