//! Deduplication pre-check and same-name collision lookup.
//!
//! Both are best-effort: any backend failure degrades to "nothing found" so
//! the task falls through to a normal upload.

use filedrop_api::UploadApi;
use filedrop_protocol::messages::{FileEntry, LinkFileRequest, PreCheckRequest, UploadResponse};
use tracing::{debug, info, warn};

/// Links an already stored object with the same content instead of
/// uploading, if the backend has one.
///
/// Returns `None` for an empty digest, no match, or any failure.
pub async fn link_existing(
    api: &dyn UploadApi,
    digest: &str,
    size: u64,
    file_name: &str,
    parent_id: Option<&str>,
) -> Option<UploadResponse> {
    if digest.is_empty() {
        return None;
    }

    let req = PreCheckRequest {
        full_hash: digest.to_string(),
        size: i64::try_from(size).ok()?,
    };
    let storage_file_id = match api.pre_check(&req).await {
        Ok(resp) if resp.exists => resp.file_id?,
        Ok(_) => return None,
        Err(e) => {
            warn!(file = file_name, error = %e, "dedup pre-check failed, uploading normally");
            return None;
        }
    };

    let link = LinkFileRequest {
        storage_file_id,
        filename: file_name.to_string(),
        parent_id: parent_id.map(str::to_string),
        expiration_hours: None,
    };
    match api.link_file(&link).await {
        Ok(resp) => {
            info!(file = file_name, file_id = %resp.file_id, "linked existing content, no transfer");
            Some(resp)
        }
        Err(e) => {
            warn!(file = file_name, error = %e, "link failed, uploading normally");
            None
        }
    }
}

/// Returns the non-folder entry named `file_name` in `parent_id`, if any.
///
/// A failed listing counts as "no entry".
pub async fn find_same_name(
    api: &dyn UploadApi,
    parent_id: Option<&str>,
    file_name: &str,
) -> Option<FileEntry> {
    match api.list_folder(parent_id).await {
        Ok(entries) => entries
            .into_iter()
            .find(|e| !e.is_folder && e.filename == file_name),
        Err(e) => {
            debug!(file = file_name, error = %e, "listing destination failed, assuming no collision");
            None
        }
    }
}

/// Returns `true` if `entry` already holds content with `digest`.
pub fn is_identical(entry: &FileEntry, digest: &str) -> bool {
    !digest.is_empty() && entry.hash.as_deref() == Some(digest)
}
