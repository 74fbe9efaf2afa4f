use std::ops::Range;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::{DEFAULT_CHUNK_SIZE, TransferError};

// ---------------------------------------------------------------------------
// Part arithmetic
// ---------------------------------------------------------------------------

/// Number of parts needed for `size` bytes: `ceil(size / chunk_size)`.
pub fn total_chunks(size: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size) as u32
}

/// Byte range of the 1-based `part` within a file of `size` bytes.
pub fn part_range(part: u32, chunk_size: u64, size: u64) -> Range<u64> {
    let start = (u64::from(part.saturating_sub(1)) * chunk_size).min(size);
    let end = (start + chunk_size).min(size);
    start..end
}

/// Length in bytes of the 1-based `part`.
pub fn part_len(part: u32, chunk_size: u64, size: u64) -> u64 {
    let r = part_range(part, chunk_size, size);
    r.end - r.start
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads numbered parts of a local file.
///
/// Holds one part in memory at a time; callers decide the order.
pub struct ChunkReader {
    file: tokio::fs::File,
    chunk_size: u64,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for part reads.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub async fn open(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(Self {
            file,
            chunk_size,
            file_size,
        })
    }

    /// Reads the 1-based `part`.
    pub async fn read_part(&mut self, part: u32) -> Result<Vec<u8>, TransferError> {
        let total = self.total_chunks();
        if part == 0 || part > total {
            return Err(TransferError::PartOutOfRange { part, total });
        }

        let range = part_range(part, self.chunk_size, self.file_size);
        self.file.seek(SeekFrom::Start(range.start)).await?;

        let mut buf = vec![0u8; (range.end - range.start) as usize];
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Number of parts in the file.
    pub fn total_chunks(&self) -> u32 {
        total_chunks(self.file_size, self.chunk_size)
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}
