//! Backend access for the upload pipeline.
//!
//! [`UploadApi`] is the seam between upload logic and the network. The
//! uploader crate only ever talks to `dyn UploadApi`; [`HttpUploadApi`] is
//! the production implementation on top of `reqwest`, and tests plug in
//! in-memory mocks.

mod api;
mod http;

pub use api::{ApiFuture, ProgressFn, SmallUpload, UploadApi};
pub use http::HttpUploadApi;

/// Errors from backend calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid access token")]
    InvalidToken,
}

impl ApiError {
    /// Whether repeating the same request may succeed.
    ///
    /// Connection-level failures, timeouts, 5xx, 408 and 429 are transient.
    /// Other 4xx answers and malformed bodies are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder() && !e.is_decode(),
            Self::Api { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Json(_) | Self::Io(_) | Self::InvalidToken => false,
        }
    }
}
