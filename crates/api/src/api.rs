use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use filedrop_protocol::messages::{
    CompleteUploadRequest, CreateFolderRequest, FileEntry, FileResponse, InitUploadRequest,
    InitUploadResponse, LinkFileRequest, PendingSession, PreCheckRequest, PreCheckResponse,
    UploadPartResponse, UploadResponse,
};

use crate::ApiError;

/// Boxed future returned by [`UploadApi`] methods.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Byte-level progress callback: receives the number of body bytes sent so
/// far for the current request.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// A single-request upload of a whole file.
#[derive(Debug, Clone, Copy)]
pub struct SmallUpload<'a> {
    pub path: &'a Path,
    pub file_name: &'a str,
    /// `None` uploads into the root folder.
    pub parent_id: Option<&'a str>,
    /// Content type of the `file` part.
    pub mime_type: &'a str,
    pub total_size: u64,
}

/// Abstract access to the file backend.
///
/// Implemented by [`HttpUploadApi`](crate::HttpUploadApi) for production.
/// Using a trait keeps the upload pipeline independent of the transport and
/// testable with mocks.
pub trait UploadApi: Send + Sync {
    /// `POST /upload` (multipart), streamed from disk.
    fn upload_small<'a>(
        &'a self,
        upload: SmallUpload<'a>,
        progress: ProgressFn,
    ) -> ApiFuture<'a, UploadResponse>;

    /// `POST /files/upload/init`.
    fn init_upload<'a>(&'a self, req: &'a InitUploadRequest) -> ApiFuture<'a, InitUploadResponse>;

    /// `PUT /files/upload/{upload_id}/chunk/{part}` with raw bytes.
    fn upload_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        part: u32,
        data: &'a [u8],
        progress: ProgressFn,
    ) -> ApiFuture<'a, UploadPartResponse>;

    /// `POST /files/upload/{upload_id}/complete`.
    fn complete_upload<'a>(
        &'a self,
        upload_id: &'a str,
        req: &'a CompleteUploadRequest,
    ) -> ApiFuture<'a, FileResponse>;

    /// `DELETE /files/upload/{upload_id}`.
    fn abort_upload<'a>(&'a self, upload_id: &'a str) -> ApiFuture<'a, ()>;

    /// `GET /files/upload/sessions`: the caller's unfinished sessions.
    fn list_pending_sessions(&self) -> ApiFuture<'_, Vec<PendingSession>>;

    /// `POST /pre-check`.
    fn pre_check<'a>(&'a self, req: &'a PreCheckRequest) -> ApiFuture<'a, PreCheckResponse>;

    /// `POST /files/link`.
    fn link_file<'a>(&'a self, req: &'a LinkFileRequest) -> ApiFuture<'a, UploadResponse>;

    /// `POST /folders`.
    fn create_folder<'a>(&'a self, req: &'a CreateFolderRequest) -> ApiFuture<'a, FileResponse>;

    /// `GET /files?parent_id=`; `None` lists the root folder.
    fn list_folder<'a>(&'a self, parent_id: Option<&'a str>) -> ApiFuture<'a, Vec<FileEntry>>;
}
