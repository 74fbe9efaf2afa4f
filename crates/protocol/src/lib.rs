//! Wire types shared by the upload client crates.
//!
//! [`messages`] mirrors the JSON bodies of the backend endpoints the upload
//! pipeline consumes; [`types`] holds the client-side task status model that
//! is surfaced to UI layers.

pub mod messages;
pub mod types;

pub use types::{UploadProgress, UploadStatus};

/// Sentinel accepted by `GET /files?parent_id=` for the user's root folder.
pub const ROOT_FOLDER_QUERY: &str = "root";
