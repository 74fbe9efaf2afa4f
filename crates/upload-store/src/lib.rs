//! Local persistence for in-flight chunked uploads.
//!
//! Keeps raw chunk bytes and per-session metadata on disk so an interrupted
//! upload can be resumed after the host application restarts:
//!
//! ```text
//! <root>/chunks/{upload_id}_chunk_{part}
//! <root>/meta/{upload_id}.json
//! ```
//!
//! Every read and write is keyed by upload id (and part number), so
//! concurrent sessions never touch the same file.

mod meta;
mod store;

pub use meta::UploadSessionMeta;
pub use store::{LocalUploadStore, chunk_key, config_dir, default_store_dir};

/// Errors from the local upload store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] filedrop_transfer::TransferError),

    #[error("invalid upload id: {0:?}")]
    InvalidKey(String),

    #[error("store directory not available")]
    NoStoreDir,
}
