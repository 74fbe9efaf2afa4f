//! One file's upload: single-request or chunked, with persistence and
//! finalize.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use filedrop_api::{ProgressFn, SmallUpload, UploadApi};
use filedrop_protocol::UploadStatus;
use filedrop_protocol::messages::{CompleteUploadRequest, InitUploadRequest};
use filedrop_transfer::{ChunkProgress, ContentHasher, RetryPolicy, part_len, total_chunks};
use filedrop_upload_store::{LocalUploadStore, UploadSessionMeta};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::tasks::TaskHandle;
use crate::transport::{ChunkTransport, PercentFn};

/// Collaborators shared by every session of one manager.
pub(crate) struct UploadContext {
    pub(crate) api: Arc<dyn UploadApi>,
    pub(crate) store: Arc<LocalUploadStore>,
    pub(crate) config: UploaderConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) hasher: ContentHasher,
}

impl UploadContext {
    pub(crate) fn new(
        api: Arc<dyn UploadApi>,
        store: Arc<LocalUploadStore>,
        config: UploaderConfig,
    ) -> Self {
        Self {
            retry: config.retry_policy(),
            hasher: config.content_hasher(),
            api,
            store,
            config,
        }
    }
}

/// What to upload and where.
pub(crate) struct FileTarget<'a> {
    pub(crate) path: &'a Path,
    pub(crate) file_name: &'a str,
    pub(crate) size: u64,
    pub(crate) parent_id: Option<&'a str>,
    /// Content digest; empty when unknown.
    pub(crate) digest: &'a str,
}

/// Races `fut` against cancellation.
pub(crate) async fn or_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, UploadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        r = fut => Ok(r),
    }
}

/// Like [`or_cancelled`] for fallible futures.
pub(crate) async fn cancellable<T, E, F>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, UploadError>
where
    F: Future<Output = Result<T, E>>,
    UploadError: From<E>,
{
    or_cancelled(cancel, fut).await?.map_err(UploadError::from)
}

fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (done.min(total) * 100 / total) as u8
}

/// Content type sent with an upload, from the file extension.
pub(crate) fn guess_mime(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .to_string()
}

/// Drives one upload on behalf of a task.
pub(crate) struct UploadSession<'a> {
    ctx: &'a UploadContext,
    task: &'a TaskHandle,
    cancel: &'a CancellationToken,
}

impl<'a> UploadSession<'a> {
    pub(crate) fn new(
        ctx: &'a UploadContext,
        task: &'a TaskHandle,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self { ctx, task, cancel }
    }

    /// Uploads `target`, picking the path by size. Returns the new file id.
    pub(crate) async fn upload(&self, target: &FileTarget<'_>) -> Result<String, UploadError> {
        if target.size <= self.ctx.config.small_file_threshold {
            self.upload_small(target).await
        } else {
            self.upload_chunked(target).await
        }
    }

    /// Single multipart request. Not resumable.
    async fn upload_small(&self, target: &FileTarget<'_>) -> Result<String, UploadError> {
        self.task.transition(UploadStatus::Uploading);

        let total = target.size;
        let progress: ProgressFn = {
            let task = self.task.clone();
            Arc::new(move |sent| {
                task.progress(percent_of(sent, total));
                // The body is out; the server is still storing it.
                if sent >= total {
                    task.transition(UploadStatus::Processing);
                }
            })
        };
        let mime_type = guess_mime(target.file_name);
        let upload = SmallUpload {
            path: target.path,
            file_name: target.file_name,
            parent_id: target.parent_id,
            mime_type: &mime_type,
            total_size: target.size,
        };

        let resp = cancellable(self.cancel, self.ctx.api.upload_small(upload, progress)).await?;
        debug!(task = %self.task.id(), file_id = %resp.file_id, "single-request upload done");
        Ok(resp.file_id)
    }

    /// Init, persist every chunk locally, transfer, finalize.
    async fn upload_chunked(&self, target: &FileTarget<'_>) -> Result<String, UploadError> {
        self.task.transition(UploadStatus::Uploading);

        let mime_type = guess_mime(target.file_name);
        let req = InitUploadRequest {
            file_name: target.file_name.to_string(),
            file_type: Some(mime_type.clone()),
            total_size: i64::try_from(target.size).unwrap_or(i64::MAX),
        };
        let init = cancellable(self.cancel, self.ctx.api.init_upload(&req)).await?;
        let chunk_size = self.ctx.config.effective_chunk_size(init.chunk_size);
        self.task.set_server_upload_id(&init.upload_id);

        let meta = UploadSessionMeta {
            upload_id: init.upload_id,
            file_name: target.file_name.to_string(),
            file_type: Some(mime_type),
            total_size_bytes: target.size,
            chunk_size_bytes: chunk_size,
            total_chunks: total_chunks(target.size, chunk_size),
            destination_folder_id: target.parent_id.map(str::to_string),
            created_at: Utc::now(),
            source_path: Some(target.path.to_path_buf()),
            digest: target.digest.to_string(),
        };
        info!(
            task = %self.task.id(),
            upload_id = %meta.upload_id,
            chunks = meta.total_chunks,
            chunk_size,
            "chunked upload session started"
        );

        // Nothing has been sent yet, so a failed persist leaves nothing worth
        // resuming.
        if let Err(e) = cancellable(
            self.cancel,
            self.ctx.store.persist_file(&meta, target.path),
        )
        .await
        {
            self.discard(&meta.upload_id).await;
            return Err(e);
        }

        self.transfer_and_finalize(&meta, &[]).await
    }

    /// Continues a persisted session, skipping the parts the server already
    /// holds.
    pub(crate) async fn resume(
        &self,
        meta: &UploadSessionMeta,
        uploaded_parts: &[u32],
    ) -> Result<String, UploadError> {
        self.task.transition(UploadStatus::Uploading);
        self.task.set_server_upload_id(&meta.upload_id);
        self.transfer_and_finalize(meta, uploaded_parts).await
    }

    async fn transfer_and_finalize(
        &self,
        meta: &UploadSessionMeta,
        uploaded_parts: &[u32],
    ) -> Result<String, UploadError> {
        let missing: Vec<u32> = meta
            .parts()
            .filter(|p| !uploaded_parts.contains(p))
            .collect();

        let progress = Arc::new(ChunkProgress::new(meta.total_size_bytes));
        for &part in uploaded_parts {
            progress.update(
                part,
                part_len(part, meta.chunk_size_bytes, meta.total_size_bytes),
            );
        }
        let on_percent: PercentFn = {
            let task = self.task.clone();
            Arc::new(move |pct| task.progress(pct))
        };
        on_percent(progress.percent());

        let transport = ChunkTransport::new(
            self.ctx.api.as_ref(),
            self.ctx.store.as_ref(),
            &self.ctx.retry,
            self.ctx.config.chunk_concurrency,
            self.cancel,
        );
        match transport
            .send_parts(&meta.upload_id, missing, progress, on_percent)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                self.discard(&meta.upload_id).await;
                return Err(e);
            }
            // Local chunks stay for a later resume.
            Err(e) => return Err(e),
        }

        self.finalize(meta).await
    }

    /// Completes the session and purges local state on success.
    ///
    /// A failed finalize keeps the persisted chunks so a later resume does
    /// not need to re-read the source file.
    async fn finalize(&self, meta: &UploadSessionMeta) -> Result<String, UploadError> {
        self.task.transition(UploadStatus::Processing);

        let req = CompleteUploadRequest {
            parent_id: meta.destination_folder_id.clone(),
            hash: (!meta.digest.is_empty()).then(|| meta.digest.clone()),
        };
        match cancellable(
            self.cancel,
            self.ctx.api.complete_upload(&meta.upload_id, &req),
        )
        .await
        {
            Ok(file) => {
                if let Err(e) = self.ctx.store.delete_session(&meta.upload_id).await {
                    warn!(upload_id = %meta.upload_id, error = %e, "failed to purge local upload state");
                }
                info!(task = %self.task.id(), upload_id = %meta.upload_id, file_id = %file.id, "upload finalized");
                Ok(file.id)
            }
            Err(e) if e.is_cancelled() => {
                self.discard(&meta.upload_id).await;
                Err(e)
            }
            Err(e) => {
                warn!(upload_id = %meta.upload_id, error = %e, "finalize failed, keeping local chunks");
                Err(e)
            }
        }
    }

    /// Best-effort server abort plus unconditional local purge.
    async fn discard(&self, upload_id: &str) {
        if let Err(e) = self.ctx.api.abort_upload(upload_id).await {
            warn!(upload_id, error = %e, "abort failed");
        }
        if let Err(e) = self.ctx.store.delete_session(upload_id).await {
            warn!(upload_id, error = %e, "failed to purge local upload state");
        }
        debug!(upload_id, "upload session discarded");
    }
}
