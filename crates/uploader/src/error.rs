//! Upload pipeline error types.

use filedrop_api::ApiError;
use filedrop_transfer::TransferError;
use filedrop_upload_store::StoreError;

/// Errors produced while uploading.
///
/// The `Display` string is what ends up in a failed task's error message.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The user declined to overwrite an existing file.
    #[error("Cancelled")]
    Declined,

    /// The task was cancelled while work was in flight.
    #[error("cancelled")]
    Cancelled,

    #[error("folder {name:?} could not be created or found: {source}")]
    FolderUnavailable {
        name: String,
        #[source]
        source: ApiError,
    },

    #[error("chunk {part} of upload {upload_id} is missing locally")]
    MissingChunk { upload_id: String, part: u32 },

    #[error("no config directory available")]
    NoConfigDir,
}

impl UploadError {
    /// Returns `true` if the error represents a cancellation rather than a
    /// failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
