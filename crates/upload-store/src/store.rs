use std::path::{Path, PathBuf};

use filedrop_transfer::ChunkReader;
use tracing::{debug, warn};

use crate::{StoreError, UploadSessionMeta};

const CHUNKS_DIR: &str = "chunks";
const META_DIR: &str = "meta";

/// Storage key of one persisted chunk: `"{upload_id}_chunk_{part}"`.
pub fn chunk_key(upload_id: &str, part: u32) -> String {
    format!("{upload_id}_chunk_{part}")
}

/// Returns the default store directory (`<config dir>/filedrop/uploads`).
pub fn default_store_dir() -> Option<PathBuf> {
    config_dir().map(|d| d.join("filedrop").join("uploads"))
}

/// File-system backed store for chunk bytes and session metadata.
///
/// Cheap to clone; clones share the same directory.
#[derive(Debug, Clone)]
pub struct LocalUploadStore {
    root: PathBuf,
}

impl LocalUploadStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(CHUNKS_DIR)).await?;
        tokio::fs::create_dir_all(root.join(META_DIR)).await?;
        Ok(Self { root })
    }

    /// Opens the store at [`default_store_dir`].
    pub async fn open_default() -> Result<Self, StoreError> {
        let root = default_store_dir().ok_or(StoreError::NoStoreDir)?;
        Self::open(root).await
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    /// Writes (or replaces) the metadata of a session.
    pub async fn save_meta(&self, meta: &UploadSessionMeta) -> Result<(), StoreError> {
        let path = self.meta_path(&meta.upload_id)?;
        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic(&path, &json).await
    }

    /// Returns the metadata of a session, if persisted.
    pub async fn get_meta(&self, upload_id: &str) -> Result<Option<UploadSessionMeta>, StoreError> {
        let path = self.meta_path(upload_id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns every persisted session. Unreadable entries are skipped.
    pub async fn list_metas(&self) -> Result<Vec<UploadSessionMeta>, StoreError> {
        let mut metas = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(META_DIR)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = match tokio::fs::read(&path).await {
                Ok(data) => serde_json::from_slice::<UploadSessionMeta>(&data)
                    .map_err(StoreError::from),
                Err(e) => Err(e.into()),
            };
            match parsed {
                Ok(meta) => metas.push(meta),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable upload meta"),
            }
        }

        metas.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(metas)
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    /// Writes the bytes of one part.
    pub async fn save_chunk(&self, upload_id: &str, part: u32, data: &[u8]) -> Result<(), StoreError> {
        let path = self.chunk_path(upload_id, part)?;
        write_atomic(&path, data).await
    }

    /// Reads the bytes of one part, if persisted.
    pub async fn get_chunk(&self, upload_id: &str, part: u32) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.chunk_path(upload_id, part)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Sorted part numbers persisted for a session.
    pub async fn chunk_parts(&self, upload_id: &str) -> Result<Vec<u32>, StoreError> {
        validate_upload_id(upload_id)?;
        let prefix = format!("{upload_id}_chunk_");

        let mut parts = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(CHUNKS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(part) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.parse::<u32>().ok())
            {
                parts.push(part);
            }
        }
        parts.sort_unstable();
        Ok(parts)
    }

    /// Persists the metadata and every chunk of `source`.
    ///
    /// Metadata is written first so an interrupted persist still leaves a
    /// discoverable session. Only one chunk is held in memory at a time.
    pub async fn persist_file(&self, meta: &UploadSessionMeta, source: &Path) -> Result<(), StoreError> {
        self.save_meta(meta).await?;

        let mut reader = ChunkReader::open(source, meta.chunk_size_bytes).await?;
        for part in meta.parts() {
            let data = reader.read_part(part).await?;
            self.save_chunk(&meta.upload_id, part, &data).await?;
        }

        debug!(
            upload_id = %meta.upload_id,
            chunks = meta.total_chunks,
            "persisted upload chunks"
        );
        Ok(())
    }

    /// Removes the metadata and every chunk of a session.
    ///
    /// Half-written leftovers of an interrupted write are removed as well.
    pub async fn delete_session(&self, upload_id: &str) -> Result<(), StoreError> {
        validate_upload_id(upload_id)?;
        let prefix = format!("{upload_id}_chunk_");

        let mut entries = tokio::fs::read_dir(self.root.join(CHUNKS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(rest) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
                continue;
            };
            // `{part}` or `{part}.tmp`
            if rest.starts_with(|c: char| c.is_ascii_digit()) {
                remove_if_exists(&entry.path()).await?;
            }
        }

        let meta = self.meta_path(upload_id)?;
        remove_if_exists(&tmp_path(&meta)).await?;
        remove_if_exists(&meta).await?;
        debug!(upload_id, "purged local upload state");
        Ok(())
    }

    fn chunk_path(&self, upload_id: &str, part: u32) -> Result<PathBuf, StoreError> {
        validate_upload_id(upload_id)?;
        Ok(self.root.join(CHUNKS_DIR).join(chunk_key(upload_id, part)))
    }

    fn meta_path(&self, upload_id: &str) -> Result<PathBuf, StoreError> {
        validate_upload_id(upload_id)?;
        Ok(self.root.join(META_DIR).join(format!("{upload_id}.json")))
    }
}

/// Upload ids become file names, so they must be a single plain component.
fn validate_upload_id(upload_id: &str) -> Result<(), StoreError> {
    let bad = upload_id.is_empty()
        || upload_id == "."
        || upload_id.contains("..")
        || upload_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if bad {
        return Err(StoreError::InvalidKey(upload_id.to_string()));
    }
    Ok(())
}

/// Writes via a temporary sibling and rename, so readers never see a
/// half-written file.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Returns the platform-specific config directory: `$XDG_CONFIG_HOME` (or
/// `~/.config`) on Linux, `%APPDATA%` on Windows.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
