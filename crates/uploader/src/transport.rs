//! Chunk transfer with retry and a bounded per-file worker pool.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use filedrop_api::{ApiError, ProgressFn, UploadApi};
use filedrop_transfer::{ChunkProgress, RetryError, RetryPolicy};
use filedrop_upload_store::LocalUploadStore;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::UploadError;

/// Receives the aggregate percentage of a file (0–99).
pub type PercentFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Sends the persisted chunks of one upload session.
pub struct ChunkTransport<'a> {
    api: &'a dyn UploadApi,
    store: &'a LocalUploadStore,
    policy: &'a RetryPolicy,
    concurrency: usize,
    cancel: &'a CancellationToken,
}

impl<'a> ChunkTransport<'a> {
    pub fn new(
        api: &'a dyn UploadApi,
        store: &'a LocalUploadStore,
        policy: &'a RetryPolicy,
        concurrency: usize,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            api,
            store,
            policy,
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// Sends `parts` with at most `concurrency` requests in flight.
    ///
    /// Parts may complete in any order. After the first failure no new parts
    /// are started; the first error is returned once in-flight parts settle.
    pub async fn send_parts(
        &self,
        upload_id: &str,
        parts: Vec<u32>,
        progress: Arc<ChunkProgress>,
        on_percent: PercentFn,
    ) -> Result<(), UploadError> {
        if parts.is_empty() {
            return Ok(());
        }

        debug!(upload_id, parts = parts.len(), workers = self.concurrency, "sending chunks");
        let queue = Mutex::new(VecDeque::from(parts));
        let workers = self.concurrency.min(queue_len(&queue));

        let results = join_all(
            (0..workers).map(|_| self.worker(upload_id, &queue, &progress, &on_percent)),
        )
        .await;
        results.into_iter().collect()
    }

    async fn worker(
        &self,
        upload_id: &str,
        queue: &Mutex<VecDeque<u32>>,
        progress: &Arc<ChunkProgress>,
        on_percent: &PercentFn,
    ) -> Result<(), UploadError> {
        while let Some(part) = pop(queue) {
            if let Err(e) = self.transfer_one(upload_id, part, progress, on_percent).await {
                queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn transfer_one(
        &self,
        upload_id: &str,
        part: u32,
        progress: &Arc<ChunkProgress>,
        on_percent: &PercentFn,
    ) -> Result<(), UploadError> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        let data = self
            .store
            .get_chunk(upload_id, part)
            .await?
            .ok_or_else(|| UploadError::MissingChunk {
                upload_id: upload_id.to_string(),
                part,
            })?;
        self.send_part(upload_id, part, &data, progress, on_percent)
            .await
    }

    /// Sends one part, retrying transient failures with backoff.
    pub async fn send_part(
        &self,
        upload_id: &str,
        part: u32,
        data: &[u8],
        progress: &Arc<ChunkProgress>,
        on_percent: &PercentFn,
    ) -> Result<(), UploadError> {
        let result = self
            .policy
            .run(
                self.cancel,
                |attempt| {
                    // A retried part starts over.
                    on_percent(progress.update(part, 0));
                    if attempt > 1 {
                        debug!(upload_id, part, attempt, "retrying chunk");
                    }
                    let callback: ProgressFn = {
                        let progress = Arc::clone(progress);
                        let on_percent = Arc::clone(on_percent);
                        Arc::new(move |sent| on_percent(progress.update(part, sent)))
                    };
                    self.api.upload_chunk(upload_id, part, data, callback)
                },
                ApiError::is_transient,
            )
            .await;

        match result {
            Ok(_) => {
                on_percent(progress.update(part, data.len() as u64));
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(UploadError::Cancelled),
            Err(RetryError::Failed { attempts, source }) => {
                warn!(upload_id, part, attempts, error = %source, "chunk failed");
                Err(source.into())
            }
        }
    }
}

fn pop(queue: &Mutex<VecDeque<u32>>) -> Option<u32> {
    queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
}

fn queue_len(queue: &Mutex<VecDeque<u32>>) -> usize {
    queue.lock().unwrap_or_else(|e| e.into_inner()).len()
}
