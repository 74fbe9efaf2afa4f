//! `reqwest` implementation of [`UploadApi`].

use std::time::Duration;

use filedrop_protocol::ROOT_FOLDER_QUERY;
use filedrop_protocol::messages::{
    CompleteUploadRequest, CreateFolderRequest, FileEntry, FileResponse, InitUploadRequest,
    InitUploadResponse, LinkFileRequest, PendingSession, PreCheckRequest, PreCheckResponse,
    UploadPartResponse, UploadResponse,
};
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::api::{ApiFuture, ProgressFn, SmallUpload, UploadApi};
use crate::ApiError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Size of the body pieces handed to the HTTP stack; progress is reported
/// once per piece.
const BODY_SLICE: usize = 64 * 1024;

/// HTTP client for the file backend.
pub struct HttpUploadApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpUploadApi {
    /// Creates a client for `base_url`, authenticating with `access_token`
    /// as a bearer token when given.
    pub fn new(base_url: &str, access_token: Option<&str>) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = access_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| ApiError::InvalidToken)?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    /// Fails with [`ApiError::Api`] on non-2xx answers.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
        let body = Self::check(resp).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn post_json<B, T>(&self, endpoint: &str, body: &B) -> Result<T, ApiError>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self.http.post(self.url(endpoint)).json(body).send().await?;
        Self::read_json(resp).await
    }
}

/// Wraps owned body pieces into a stream that reports cumulative bytes.
fn progress_body(data: &[u8], progress: ProgressFn) -> reqwest::Body {
    let pieces: Vec<Result<Vec<u8>, std::io::Error>> =
        data.chunks(BODY_SLICE).map(|c| Ok(c.to_vec())).collect();

    let mut sent = 0u64;
    let stream = futures_util::stream::iter(pieces).inspect(move |piece| {
        if let Ok(bytes) = piece {
            sent += bytes.len() as u64;
            progress(sent);
        }
    });
    reqwest::Body::wrap_stream(stream)
}

impl UploadApi for HttpUploadApi {
    fn upload_small<'a>(
        &'a self,
        upload: SmallUpload<'a>,
        progress: ProgressFn,
    ) -> ApiFuture<'a, UploadResponse> {
        Box::pin(async move {
            let file = tokio::fs::File::open(upload.path).await?;

            let mut sent = 0u64;
            let stream = tokio_util::io::ReaderStream::new(file).inspect(move |piece| {
                if let Ok(bytes) = piece {
                    sent += bytes.len() as u64;
                    progress(sent);
                }
            });
            let body = reqwest::Body::wrap_stream(stream);

            let part = reqwest::multipart::Part::stream_with_length(body, upload.total_size)
                .file_name(upload.file_name.to_string())
                .mime_str(upload.mime_type)?;
            let mut form = reqwest::multipart::Form::new()
                .part("file", part)
                .text("total_size", upload.total_size.to_string());
            if let Some(parent) = upload.parent_id {
                form = form.text("parent_id", parent.to_string());
            }

            debug!(file = upload.file_name, size = upload.total_size, "single-request upload");
            let resp = self
                .http
                .post(self.url("/upload"))
                .multipart(form)
                .send()
                .await?;
            Self::read_json(resp).await
        })
    }

    fn init_upload<'a>(&'a self, req: &'a InitUploadRequest) -> ApiFuture<'a, InitUploadResponse> {
        Box::pin(self.post_json("/files/upload/init", req))
    }

    fn upload_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        part: u32,
        data: &'a [u8],
        progress: ProgressFn,
    ) -> ApiFuture<'a, UploadPartResponse> {
        Box::pin(async move {
            let resp = self
                .http
                .put(self.url(&format!("/files/upload/{upload_id}/chunk/{part}")))
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, data.len())
                .body(progress_body(data, progress))
                .send()
                .await?;
            Self::read_json(resp).await
        })
    }

    fn complete_upload<'a>(
        &'a self,
        upload_id: &'a str,
        req: &'a CompleteUploadRequest,
    ) -> ApiFuture<'a, FileResponse> {
        Box::pin(async move {
            self.post_json(&format!("/files/upload/{upload_id}/complete"), req)
                .await
        })
    }

    fn abort_upload<'a>(&'a self, upload_id: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let resp = self
                .http
                .delete(self.url(&format!("/files/upload/{upload_id}")))
                .send()
                .await?;
            Self::check(resp).await?;
            Ok(())
        })
    }

    fn list_pending_sessions(&self) -> ApiFuture<'_, Vec<PendingSession>> {
        Box::pin(async move {
            let resp = self
                .http
                .get(self.url("/files/upload/sessions"))
                .send()
                .await?;
            Self::read_json(resp).await
        })
    }

    fn pre_check<'a>(&'a self, req: &'a PreCheckRequest) -> ApiFuture<'a, PreCheckResponse> {
        Box::pin(self.post_json("/pre-check", req))
    }

    fn link_file<'a>(&'a self, req: &'a LinkFileRequest) -> ApiFuture<'a, UploadResponse> {
        Box::pin(self.post_json("/files/link", req))
    }

    fn create_folder<'a>(&'a self, req: &'a CreateFolderRequest) -> ApiFuture<'a, FileResponse> {
        Box::pin(self.post_json("/folders", req))
    }

    fn list_folder<'a>(&'a self, parent_id: Option<&'a str>) -> ApiFuture<'a, Vec<FileEntry>> {
        Box::pin(async move {
            let parent = parent_id.unwrap_or(ROOT_FOLDER_QUERY);
            let resp = self
                .http
                .get(self.url("/files"))
                .query(&[("parent_id", parent)])
                .send()
                .await?;
            Self::read_json(resp).await
        })
    }
}
