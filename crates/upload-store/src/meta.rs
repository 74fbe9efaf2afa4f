use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted description of one chunked upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSessionMeta {
    /// Server-assigned session id.
    pub upload_id: String,
    pub file_name: String,
    #[serde(default)]
    pub file_type: Option<String>,
    pub total_size_bytes: u64,
    pub chunk_size_bytes: u64,
    pub total_chunks: u32,
    /// `None` means the user's root folder.
    #[serde(default)]
    pub destination_folder_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    /// Content digest computed before the upload started (may be empty).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
}

impl UploadSessionMeta {
    /// Part numbers of the session, `1..=total_chunks`.
    pub fn parts(&self) -> impl Iterator<Item = u32> {
        1..=self.total_chunks
    }

    /// Age of the session relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}
