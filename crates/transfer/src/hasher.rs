use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use xxhash_rust::xxh3::{Xxh3, xxh3_128};

use crate::{HASH_SIZE_CEILING, HASH_SLICE_SIZE, TransferError};

/// Computes XXH3-128 of `data` as 32 lowercase hex chars.
pub fn digest_bytes(data: &[u8]) -> String {
    format!("{:032x}", xxh3_128(data))
}

/// Streams files through XXH3-128 to produce a deduplication fingerprint.
///
/// An empty digest means "unknown": callers must not deduplicate on it.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    slice_size: usize,
    size_ceiling: u64,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new(HASH_SLICE_SIZE, HASH_SIZE_CEILING)
    }
}

impl ContentHasher {
    /// Creates a hasher. A `slice_size` of 0 falls back to [`HASH_SLICE_SIZE`].
    pub fn new(slice_size: usize, size_ceiling: u64) -> Self {
        let slice_size = if slice_size == 0 {
            HASH_SLICE_SIZE
        } else {
            slice_size
        };
        Self {
            slice_size,
            size_ceiling,
        }
    }

    /// Hashes the file at `path`, reporting percent progress after each slice.
    ///
    /// Never fails: files over the size ceiling and read errors both yield an
    /// empty digest.
    pub async fn hash_file(
        &self,
        path: &Path,
        progress: Option<&(dyn Fn(u8) + Send + Sync)>,
    ) -> String {
        match self.try_hash_file(path, progress).await {
            Ok(digest) => digest,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "hashing failed, skipping dedup");
                String::new()
            }
        }
    }

    async fn try_hash_file(
        &self,
        path: &Path,
        progress: Option<&(dyn Fn(u8) + Send + Sync)>,
    ) -> Result<String, TransferError> {
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        if size > self.size_ceiling {
            debug!(path = %path.display(), size, "file above hash ceiling");
            return Ok(String::new());
        }

        let mut hasher = Xxh3::new();
        let mut buf = vec![0u8; self.slice_size];
        let mut read: u64 = 0;

        loop {
            let n = fill_slice(&mut file, &mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            read += n as u64;

            if let Some(cb) = progress {
                cb(percent(read, size));
            }
            // Let other uploads make progress between slices.
            tokio::task::yield_now().await;
        }

        if let Some(cb) = progress
            && size == 0
        {
            cb(100);
        }

        Ok(format!("{:032x}", hasher.digest128()))
    }
}

/// Reads until `buf` is full or EOF. Returns the number of bytes read.
async fn fill_slice(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}
