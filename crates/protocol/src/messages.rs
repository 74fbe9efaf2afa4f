use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Chunked upload session
// ---------------------------------------------------------------------------

/// Body of `POST /files/upload/init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitUploadRequest {
    pub file_name: String,
    pub file_type: Option<String>,
    pub total_size: i64,
}

/// Response of `POST /files/upload/init`.
///
/// `chunk_size` is authoritative: it overrides any client-side default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitUploadResponse {
    pub upload_id: String,
    pub chunk_size: i64,
    #[serde(default)]
    pub key: String,
}

/// Response of `PUT /files/upload/{upload_id}/chunk/{part_number}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadPartResponse {
    pub etag: String,
}

/// Body of `POST /files/upload/{upload_id}/complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteUploadRequest {
    pub parent_id: Option<String>,
    /// Client-computed content digest; lets the server skip re-hashing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// An unfinished chunked session as reported by `GET /files/upload/sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSession {
    pub upload_id: String,
    pub file_name: String,
    #[serde(default)]
    pub file_type: Option<String>,
    pub total_size: i64,
    pub chunk_size: i64,
    pub total_chunks: i32,
    pub uploaded_chunks: i32,
    #[serde(default)]
    pub uploaded_parts: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<FixedOffset>>,
}

impl PendingSession {
    /// Returns `true` if the server already holds `part_number`.
    pub fn has_part(&self, part_number: u32) -> bool {
        self.uploaded_parts
            .iter()
            .any(|&p| p >= 0 && p as u32 == part_number)
    }
}

// ---------------------------------------------------------------------------
// File records
// ---------------------------------------------------------------------------

/// File record returned by the complete endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileResponse {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    pub size: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub mime_type: Option<String>,
    pub parent_id: Option<String>,
}

/// Response of the single-request upload and of the link endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_id: String,
    pub filename: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One entry of a folder listing (`GET /files`) or a created folder
/// (`POST /folders`).
///
/// Only the fields the upload pipeline reads are modelled; the backend sends
/// more, which are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub is_folder: bool,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Content digest of the stored object (files only).
    #[serde(default)]
    pub hash: Option<String>,
}

/// Body of `POST /folders`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateFolderRequest {
    pub name: String,
    pub parent_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

/// Body of `POST /pre-check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreCheckRequest {
    pub full_hash: String,
    pub size: i64,
}

/// Response of `POST /pre-check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreCheckResponse {
    pub exists: bool,
    #[serde(default)]
    pub upload_token: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
}

/// Body of `POST /files/link`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkFileRequest {
    pub storage_file_id: String,
    pub filename: String,
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_hours: Option<i64>,
}
