//! Top-level upload orchestration.
//!
//! [`UploadQueueManager`] accepts batches of files, runs them through a
//! bounded pool of file workers, surfaces live status as [`UploadEvent`]s and
//! resolves name collisions with the user.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use filedrop_api::{HttpUploadApi, UploadApi};
use filedrop_protocol::UploadStatus;
use filedrop_transfer::{check_file_name, folder_segments, leaf_name};
use filedrop_upload_store::LocalUploadStore;
use futures_util::future::join_all;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UploaderConfig;
use crate::dedup;
use crate::error::UploadError;
use crate::folders::FolderResolver;
use crate::resume::{ResumeCoordinator, ResumePlan};
use crate::session::{FileTarget, UploadContext, UploadSession, cancellable, or_cancelled};
use crate::tasks::{EventSink, TaskHandle, TaskTable};
use crate::types::{ConflictResolution, TaskSnapshot, UploadEvent, UploadRequest, UploadTask};

const EVENT_CHANNEL_CAPACITY: usize = 256;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Where `req` lands under the destination root. An empty relative path
/// means the root; one ending in `/` names the folder and keeps the source
/// file name.
fn destination_path(req: &UploadRequest) -> String {
    let source_name = || {
        req.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    if req.relative_path.is_empty() {
        source_name()
    } else if req.relative_path.ends_with('/') {
        format!("{}{}", req.relative_path, source_name())
    } else {
        req.relative_path.clone()
    }
}

/// State carried over a collision prompt.
struct Decided {
    parent_id: Option<String>,
    digest: String,
    resolution: ConflictResolution,
}

/// One admitted file of a batch.
struct Job {
    task_id: String,
    path: PathBuf,
    file_name: String,
    folders: Vec<String>,
    size: u64,
    decided: Option<Decided>,
}

/// How a task ended successfully.
struct Finished {
    file_id: String,
    parent_id: Option<String>,
    /// `false` when the destination already held identical content.
    changed: bool,
}

/// Work queue shared by the file workers of one batch.
///
/// Jobs waiting on a collision prompt are parked outside the queue so they
/// never occupy a worker; workers stay alive until the queue is empty and
/// nothing is parked.
#[derive(Default)]
struct BatchQueue {
    state: Mutex<BatchState>,
    wake: Notify,
}

#[derive(Default)]
struct BatchState {
    ready: VecDeque<Job>,
    parked: usize,
}

impl BatchQueue {
    fn new(jobs: VecDeque<Job>) -> Self {
        Self {
            state: Mutex::new(BatchState {
                ready: jobs,
                parked: 0,
            }),
            wake: Notify::new(),
        }
    }

    fn len(&self) -> usize {
        lock(&self.state).ready.len()
    }

    fn park(&self) {
        lock(&self.state).parked += 1;
    }

    /// Releases a parked slot, requeueing `job` if given.
    fn unpark(&self, job: Option<Job>) {
        {
            let mut s = lock(&self.state);
            s.parked = s.parked.saturating_sub(1);
            if let Some(job) = job {
                s.ready.push_back(job);
            }
        }
        self.wake.notify_waiters();
    }

    fn abandon_parked(&self) {
        lock(&self.state).parked = 0;
        self.wake.notify_waiters();
    }

    /// Next job to run, or `None` once the batch is drained.
    async fn next(&self, shutdown: &CancellationToken) -> Option<Job> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut s = lock(&self.state);
                if let Some(job) = s.ready.pop_front() {
                    return Some(job);
                }
                if s.parked == 0 {
                    return None;
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.cancelled() => {
                    self.abandon_parked();
                }
            }
        }
    }
}

/// Result of running a job.
enum Outcome {
    Finished(Finished),
    /// A different file with the same name exists; the job must wait for
    /// the user's decision.
    Collision { job: Job, existing_file_id: String },
}

/// A job waiting for the user's overwrite decision.
struct Parked {
    job: Job,
    batch: Arc<BatchQueue>,
}

/// Orchestrates uploads for one host application session.
///
/// All state (tasks, prompts, cancellation tokens) lives on the instance;
/// several managers never share anything but the injected collaborators.
pub struct UploadQueueManager {
    ctx: UploadContext,
    tasks: Arc<TaskTable>,
    tokens: Mutex<HashMap<String, CancellationToken>>,
    prompts: Mutex<HashMap<String, Parked>>,
    events: EventSink,
    events_rx: Mutex<Option<mpsc::Receiver<UploadEvent>>>,
    cancel: CancellationToken,
    resumed: AtomicBool,
}

impl UploadQueueManager {
    /// Creates a manager on top of the given backend and local store.
    pub fn new(
        api: Arc<dyn UploadApi>,
        store: Arc<LocalUploadStore>,
        config: UploaderConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            ctx: UploadContext::new(api, store, config),
            tasks: Arc::new(TaskTable::default()),
            tokens: Mutex::new(HashMap::new()),
            prompts: Mutex::new(HashMap::new()),
            events: EventSink::new(events_tx),
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
            resumed: AtomicBool::new(false),
        }
    }

    /// Creates a manager talking HTTP to `config.api_base_url`, with the local
    /// store at `config.store_dir` (or the per-user default).
    pub async fn connect(
        config: UploaderConfig,
        access_token: Option<&str>,
    ) -> Result<Self, UploadError> {
        let api = HttpUploadApi::new(&config.api_base_url, access_token)?;
        let store = match &config.store_dir {
            Some(dir) => LocalUploadStore::open(dir).await?,
            None => LocalUploadStore::open_default().await?,
        };
        info!(api = %api.base_url(), store = %store.root().display(), "upload manager ready");
        Ok(Self::new(Arc::new(api), Arc::new(store), config))
    }

    /// Takes the event receiver. Can only be called once.
    ///
    /// The host must keep draining it: conflict prompts and terminal events
    /// wait for channel capacity (progress updates are dropped instead).
    pub fn take_events(&self) -> Option<mpsc::Receiver<UploadEvent>> {
        lock(&self.events_rx).take()
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.ctx.config
    }

    /// Root cancellation token; every task token is a child of it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every task and releases parked prompts.
    pub fn shutdown(&self) {
        info!("upload manager shutting down");
        self.cancel.cancel();
        let parked: Vec<Parked> = lock(&self.prompts).drain().map(|(_, p)| p).collect();
        for p in parked {
            TaskHandle::new(&p.job.task_id, Arc::clone(&self.tasks), self.events.clone())
                .transition(UploadStatus::Cancelled);
            p.batch.unpark(None);
        }
    }

    /// Visible tasks in submission order. Finished tasks disappear once
    /// their linger time has passed.
    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.tasks.prune_finished(self.ctx.config.task_linger());
        self.tasks.snapshots()
    }

    pub fn snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.tasks.snapshot(task_id)
    }

    /// `true` while any task is queued, hashing, uploading or processing.
    /// Hosts use it to warn before exiting, since in-flight single-request
    /// uploads cannot be resumed.
    pub fn has_active_uploads(&self) -> bool {
        self.tasks.any_active()
    }

    /// Answers a pending [`UploadEvent::ConflictDetected`] prompt.
    ///
    /// Returns `false` if no prompt is pending for `task_id`.
    pub fn resolve_conflict(&self, task_id: &str, resolution: ConflictResolution) -> bool {
        let parked = lock(&self.prompts).remove(task_id);
        let Some(mut parked) = parked else {
            return false;
        };
        debug!(task = task_id, ?resolution, "conflict resolved");
        if let Some(decided) = parked.job.decided.as_mut() {
            decided.resolution = resolution;
        }
        parked.batch.unpark(Some(parked.job));
        true
    }

    /// Cancels a task: in-flight requests are dropped, the server session
    /// (if any) is aborted and local state purged. The task is removed from
    /// the visible set immediately. Sibling tasks are unaffected.
    ///
    /// Returns `false` for unknown or already finished tasks.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let handle = TaskHandle::new(task_id, Arc::clone(&self.tasks), self.events.clone());
        if !handle.transition(UploadStatus::Cancelled) {
            return false;
        }

        if let Some(token) = lock(&self.tokens).get(task_id) {
            token.cancel();
        }
        let parked = lock(&self.prompts).remove(task_id);
        if let Some(parked) = parked {
            parked.batch.unpark(Some(parked.job));
        }

        self.tasks.remove(task_id);
        info!(task = task_id, "task cancelled");
        self.events
            .send(UploadEvent::Cancelled {
                task_id: task_id.to_string(),
            })
            .await;
        true
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    /// Uploads a batch into `destination` (`None` = root folder).
    ///
    /// Returns the final state of every task of the batch that is still
    /// visible (cancelled tasks are removed). Per-task failures never abort
    /// siblings.
    pub async fn upload_batch(
        &self,
        requests: Vec<UploadRequest>,
        destination: Option<String>,
    ) -> Vec<TaskSnapshot> {
        let mut ids = Vec::with_capacity(requests.len());
        let mut jobs = VecDeque::new();
        for req in requests {
            let (id, job) = self.admit(req).await;
            ids.push(id);
            jobs.extend(job);
        }

        info!(
            files = ids.len(),
            admitted = jobs.len(),
            destination = ?destination,
            "upload batch started"
        );

        let batch = Arc::new(BatchQueue::new(jobs));
        let resolver = FolderResolver::new(self.ctx.api.as_ref(), destination);
        let workers = self.ctx.config.file_concurrency.max(1).min(batch.len());
        join_all((0..workers).map(|_| self.file_worker(&batch, &resolver))).await;

        ids.iter().filter_map(|id| self.tasks.snapshot(id)).collect()
    }

    /// Creates the task for `req` and validates it. Rejected files fail
    /// immediately without any network call.
    async fn admit(&self, req: UploadRequest) -> (String, Option<Job>) {
        let relative = destination_path(&req);

        let size = tokio::fs::metadata(&req.path).await.map(|m| m.len());
        let mut task = UploadTask::new(
            relative.clone(),
            &req.path,
            size.as_ref().copied().unwrap_or(0),
        );
        let task_id = task.id.clone();

        let validated = size
            .map_err(UploadError::from)
            .and_then(|size| self.validate(&relative, &req.path, size));
        match validated {
            Ok((file_name, folders, size)) => {
                lock(&self.tokens).insert(task_id.clone(), self.cancel.child_token());
                self.events.progress(task.snapshot());
                self.tasks.insert(task);
                let job = Job {
                    task_id: task_id.clone(),
                    path: req.path,
                    file_name,
                    folders,
                    size,
                    decided: None,
                };
                (task_id, Some(job))
            }
            Err(e) => {
                let message = e.to_string();
                warn!(task = %task_id, file = %relative, error = %message, "file rejected");
                task.fail(message.clone());
                self.events.progress(task.snapshot());
                self.tasks.insert(task);
                self.events
                    .send(UploadEvent::Failed {
                        task_id: task_id.clone(),
                        error: message,
                    })
                    .await;
                (task_id, None)
            }
        }
    }

    fn validate(
        &self,
        relative: &str,
        path: &Path,
        size: u64,
    ) -> Result<(String, Vec<String>, u64), UploadError> {
        let file_name = leaf_name(relative)?;
        check_file_name(&file_name, &self.ctx.config.blocked_extensions)?;
        let folders = folder_segments(relative)?;
        if !path.is_file() {
            return Err(UploadError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            )));
        }
        Ok((file_name, folders, size))
    }

    async fn file_worker(&self, batch: &Arc<BatchQueue>, resolver: &FolderResolver<'_>) {
        while let Some(job) = batch.next(&self.cancel).await {
            self.run_job(job, batch, resolver).await;
        }
    }

    async fn run_job(&self, job: Job, batch: &Arc<BatchQueue>, resolver: &FolderResolver<'_>) {
        let task_id = job.task_id.clone();
        let handle = TaskHandle::new(&task_id, Arc::clone(&self.tasks), self.events.clone());
        let token = lock(&self.tokens).get(&task_id).cloned();
        let Some(token) = token.filter(|t| !t.is_cancelled()) else {
            self.finish(&handle, Err(UploadError::Cancelled)).await;
            self.release(&task_id);
            return;
        };

        match self.process(job, resolver, &handle, &token).await {
            Ok(Outcome::Finished(finished)) => {
                self.finish(&handle, Ok(finished)).await;
                self.release(&task_id);
            }
            Ok(Outcome::Collision { job, existing_file_id }) => {
                self.park(job, batch, &existing_file_id).await;
            }
            Err(e) => {
                self.finish(&handle, Err(e)).await;
                self.release(&task_id);
            }
        }
    }

    fn release(&self, task_id: &str) {
        lock(&self.tokens).remove(task_id);
    }

    /// Runs one job up to completion or up to a collision prompt.
    async fn process(
        &self,
        mut job: Job,
        resolver: &FolderResolver<'_>,
        handle: &TaskHandle,
        token: &CancellationToken,
    ) -> Result<Outcome, UploadError> {
        let api = self.ctx.api.as_ref();

        let (parent_id, digest) = match job.decided.take() {
            Some(decided) => {
                if decided.resolution == ConflictResolution::Skip {
                    info!(task = %job.task_id, file = %job.file_name, "overwrite declined");
                    return Err(UploadError::Declined);
                }
                info!(task = %job.task_id, file = %job.file_name, "overwriting existing file");
                (decided.parent_id, decided.digest)
            }
            None => {
                let parent_id =
                    cancellable(token, resolver.ensure_folder_exists(&job.folders)).await?;
                let existing = or_cancelled(
                    token,
                    dedup::find_same_name(api, parent_id.as_deref(), &job.file_name),
                )
                .await?;
                let digest = self.hash(&job, handle, token).await?;

                if let Some(entry) = existing {
                    if dedup::is_identical(&entry, &digest) {
                        info!(task = %job.task_id, file = %job.file_name, "identical file already present");
                        return Ok(Outcome::Finished(Finished {
                            file_id: entry.id,
                            parent_id,
                            changed: false,
                        }));
                    }
                    job.decided = Some(Decided {
                        parent_id,
                        digest,
                        resolution: ConflictResolution::Skip,
                    });
                    return Ok(Outcome::Collision {
                        job,
                        existing_file_id: entry.id,
                    });
                }
                (parent_id, digest)
            }
        };

        let finished = self.transfer(&job, parent_id, &digest, handle, token).await?;
        Ok(Outcome::Finished(finished))
    }

    /// Hashes files under the size ceiling; larger files get no digest and
    /// skip the `hashing` state.
    async fn hash(
        &self,
        job: &Job,
        handle: &TaskHandle,
        token: &CancellationToken,
    ) -> Result<String, UploadError> {
        if job.size > self.ctx.config.hash_size_ceiling {
            return Ok(String::new());
        }

        handle.transition(UploadStatus::Hashing);
        let progress_handle = handle.clone();
        let report = move |pct: u8| progress_handle.progress(pct);
        let progress: &(dyn Fn(u8) + Send + Sync) = &report;
        let digest =
            or_cancelled(token, self.ctx.hasher.hash_file(&job.path, Some(progress))).await?;
        debug!(task = %job.task_id, digest = %digest, "hashed");
        Ok(digest)
    }

    /// Parks `job` until the user answers, then surfaces the prompt. The
    /// worker moves on to the next job meanwhile.
    async fn park(&self, job: Job, batch: &Arc<BatchQueue>, existing_file_id: &str) {
        let event = UploadEvent::ConflictDetected {
            task_id: job.task_id.clone(),
            file_name: job.file_name.clone(),
            folder_id: job.decided.as_ref().and_then(|d| d.parent_id.clone()),
            existing_file_id: existing_file_id.to_string(),
        };
        info!(task = %job.task_id, file = %job.file_name, "name collision, asking user");

        batch.park();
        lock(&self.prompts).insert(
            job.task_id.clone(),
            Parked {
                job,
                batch: Arc::clone(batch),
            },
        );
        self.events.send(event).await;
    }

    /// Link by content if possible, otherwise upload.
    async fn transfer(
        &self,
        job: &Job,
        parent_id: Option<String>,
        digest: &str,
        handle: &TaskHandle,
        token: &CancellationToken,
    ) -> Result<Finished, UploadError> {
        let linked = or_cancelled(
            token,
            dedup::link_existing(
                self.ctx.api.as_ref(),
                digest,
                job.size,
                &job.file_name,
                parent_id.as_deref(),
            ),
        )
        .await?;
        if let Some(resp) = linked {
            return Ok(Finished {
                file_id: resp.file_id,
                parent_id,
                changed: true,
            });
        }

        let session = UploadSession::new(&self.ctx, handle, token);
        let target = FileTarget {
            path: &job.path,
            file_name: &job.file_name,
            size: job.size,
            parent_id: parent_id.as_deref(),
            digest,
        };
        let file_id = session.upload(&target).await?;
        Ok(Finished {
            file_id,
            parent_id,
            changed: true,
        })
    }

    /// Records the terminal state of a task and notifies the host.
    async fn finish(&self, handle: &TaskHandle, result: Result<Finished, UploadError>) {
        let task_id = handle.id().to_string();
        match result {
            Ok(finished) => {
                if handle.transition(UploadStatus::Completed) {
                    info!(task = %task_id, file_id = %finished.file_id, "upload completed");
                    self.events
                        .send(UploadEvent::Completed {
                            task_id,
                            file_id: Some(finished.file_id),
                        })
                        .await;
                } else {
                    debug!(task = %task_id, file_id = %finished.file_id, "completed after task ended");
                }
                // The backend holds the file either way.
                if finished.changed {
                    self.events
                        .send(UploadEvent::FolderChanged {
                            folder_id: finished.parent_id,
                        })
                        .await;
                }
            }
            Err(e) if e.is_cancelled() => {
                // Explicit cancellation already removed the task; this only
                // fires for a manager shutdown.
                if handle.transition(UploadStatus::Cancelled) {
                    self.events.send(UploadEvent::Cancelled { task_id }).await;
                }
            }
            Err(e) => {
                let message = e.to_string();
                if handle.fail(&message) {
                    error!(task = %task_id, error = %message, "upload failed");
                    self.events
                        .send(UploadEvent::Failed {
                            task_id,
                            error: message,
                        })
                        .await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Resumes unfinished chunked uploads left by a previous run.
    ///
    /// Runs once per manager; later calls return nothing. Each resumable
    /// session becomes a task in `uploading` that sends only the parts the
    /// server lacks. A failed resume marks the task `error` and keeps local
    /// state for another attempt.
    pub async fn resume_pending(&self) -> Vec<TaskSnapshot> {
        if self.resumed.swap(true, Ordering::SeqCst) {
            debug!("resume already ran for this session");
            return Vec::new();
        }

        let coordinator = ResumeCoordinator::new(
            Arc::clone(&self.ctx.api),
            Arc::clone(&self.ctx.store),
        );
        let plans = coordinator.plan().await;
        if plans.is_empty() {
            return Vec::new();
        }

        let mut ids = Vec::with_capacity(plans.len());
        let mut queue = VecDeque::with_capacity(plans.len());
        for plan in plans {
            let source = plan
                .meta
                .source_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(&plan.meta.file_name));
            let task = UploadTask::new(
                plan.meta.file_name.clone(),
                source,
                plan.meta.total_size_bytes,
            );
            ids.push(task.id.clone());
            lock(&self.tokens).insert(task.id.clone(), self.cancel.child_token());
            queue.push_back((task.id.clone(), plan));
            self.tasks.insert(task);
        }

        let queue = Mutex::new(queue);
        let workers = self.ctx.config.file_concurrency.max(1).min(ids.len());
        join_all((0..workers).map(|_| self.resume_worker(&queue))).await;

        ids.iter().filter_map(|id| self.tasks.snapshot(id)).collect()
    }

    async fn resume_worker(&self, queue: &Mutex<VecDeque<(String, ResumePlan)>>) {
        loop {
            let next = lock(queue).pop_front();
            let Some((task_id, plan)) = next else { break };
            let Some(token) = lock(&self.tokens).get(&task_id).cloned() else {
                continue;
            };

            let handle = TaskHandle::new(&task_id, Arc::clone(&self.tasks), self.events.clone());
            info!(task = %task_id, upload_id = %plan.meta.upload_id, "resuming upload");
            let session = UploadSession::new(&self.ctx, &handle, &token);
            let result = session
                .resume(&plan.meta, &plan.uploaded_parts)
                .await
                .map(|file_id| Finished {
                    file_id,
                    parent_id: plan.meta.destination_folder_id.clone(),
                    changed: true,
                });
            self.finish(&handle, result).await;
            self.release(&task_id);
        }
    }

    /// Deletes local sessions the server no longer tracks and that are older
    /// than `max_age`. Returns the purged upload ids.
    pub async fn purge_orphans(&self, max_age: Duration) -> Result<Vec<String>, UploadError> {
        ResumeCoordinator::new(Arc::clone(&self.ctx.api), Arc::clone(&self.ctx.store))
            .purge_orphans(max_age)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockApi;
    use chrono::Utc;
    use filedrop_upload_store::UploadSessionMeta;
    use std::sync::atomic::Ordering;

    struct Fixture {
        tmp: tempfile::TempDir,
        api: Arc<MockApi>,
        store: Arc<LocalUploadStore>,
        manager: Arc<UploadQueueManager>,
        events: mpsc::Receiver<UploadEvent>,
    }

    fn small_config() -> UploaderConfig {
        UploaderConfig {
            small_file_threshold: 16,
            retry_initial_delay_ms: 1,
            ..UploaderConfig::default()
        }
    }

    async fn fixture(config: UploaderConfig) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let api = Arc::new(MockApi::new(8));
        let store = Arc::new(LocalUploadStore::open(tmp.path().join("store")).await.unwrap());
        let manager = Arc::new(UploadQueueManager::new(api.clone(), Arc::clone(&store), config));
        let events = manager.take_events().unwrap();
        Fixture {
            tmp,
            api,
            store,
            manager,
            events,
        }
    }

    impl Fixture {
        fn source(&self, name: &str, data: &[u8]) -> UploadRequest {
            let path = self.tmp.path().join(name.replace('/', "_"));
            std::fs::write(&path, data).unwrap();
            UploadRequest::new(path, name)
        }

        /// Drains events until `pred` matches, returning the match.
        async fn wait_for(&mut self, pred: impl Fn(&UploadEvent) -> bool) -> UploadEvent {
            loop {
                let event = self.events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        }

        /// Discards events in the background so nothing waits on the channel.
        fn spawn_drain(
            self,
        ) -> (
            Arc<MockApi>,
            Arc<LocalUploadStore>,
            Arc<UploadQueueManager>,
            tempfile::TempDir,
        ) {
            let Fixture {
                tmp,
                api,
                store,
                manager,
                mut events,
            } = self;
            tokio::spawn(async move { while events.recv().await.is_some() {} });
            (api, store, manager, tmp)
        }
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn status_of(snaps: &[TaskSnapshot], name: &str) -> UploadStatus {
        snaps
            .iter()
            .find(|s| s.display_name == name)
            .map(|s| s.status)
            .unwrap()
    }

    #[tokio::test]
    async fn batch_routes_by_size() {
        let f = fixture(small_config()).await;
        let requests = vec![f.source("a.txt", &data(10)), f.source("b.bin", &data(40))];
        let (api, store, manager, _tmp) = f.spawn_drain();

        let snaps = manager.upload_batch(requests, None).await;

        assert_eq!(snaps.len(), 2);
        assert!(snaps.iter().all(|s| s.status == UploadStatus::Completed));
        assert!(snaps.iter().all(|s| s.progress_percent == 100));
        assert_eq!(api.small_uploads(), vec!["a.txt".to_string()]);
        assert_eq!(api.chunk_puts().len(), 5);
        assert_eq!(api.files_in(None).len(), 2);
        assert!(store.list_metas().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shared_folders_are_created_once() {
        let f = fixture(small_config()).await;
        let requests = vec![
            f.source("docs/x/1.txt", b"one"),
            f.source("docs/x/2.txt", b"two"),
            f.source("docs/y/3.txt", b"three"),
            f.source("docs/4.txt", b"four"),
        ];
        let (api, _store, manager, _tmp) = f.spawn_drain();

        let snaps = manager.upload_batch(requests, None).await;

        assert!(snaps.iter().all(|s| s.status == UploadStatus::Completed));
        let mut created = api.folder_creates();
        created.sort();
        assert_eq!(created, vec!["docs", "x", "y"]);
    }

    #[tokio::test]
    async fn file_concurrency_is_bounded() {
        let f = fixture(UploaderConfig {
            file_concurrency: 2,
            ..small_config()
        })
        .await;
        let requests = (0..6)
            .map(|i| f.source(&format!("f{i}.txt"), format!("file {i}").as_bytes()))
            .collect();
        let (api, _store, manager, _tmp) = f.spawn_drain();

        manager.upload_batch(requests, None).await;

        assert_eq!(api.small_uploads().len(), 6);
        assert!(api.max_active_files() <= 2);
    }

    #[tokio::test]
    async fn file_and_chunk_limits_hold_together() {
        let f = fixture(UploaderConfig {
            file_concurrency: 3,
            chunk_concurrency: 3,
            ..small_config()
        })
        .await;
        let requests = (0..10)
            .map(|i| {
                let mut bytes = data(40);
                bytes[0] = i as u8;
                f.source(&format!("big{i}.bin"), &bytes)
            })
            .collect();
        let (api, store, manager, _tmp) = f.spawn_drain();

        let snaps = manager.upload_batch(requests, None).await;

        assert!(snaps.iter().all(|s| s.status == UploadStatus::Completed));
        assert_eq!(api.chunk_puts().len(), 50);
        assert!(api.max_active_files() <= 3);
        assert!(api.max_active_chunks() <= 3);
        assert!(store.list_metas().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trailing_slash_keeps_source_file_names() {
        let f = fixture(small_config()).await;
        let requests = (0..5)
            .map(|i| {
                let path = f.tmp.path().join(format!("photo{i}.jpg"));
                std::fs::write(&path, format!("photo {i}")).unwrap();
                UploadRequest::new(path, "a/b/")
            })
            .collect();
        let (api, _store, manager, _tmp) = f.spawn_drain();

        let snaps = manager.upload_batch(requests, None).await;

        assert_eq!(snaps.len(), 5);
        assert!(snaps.iter().all(|s| s.status == UploadStatus::Completed));
        let mut created = api.folder_creates();
        created.sort();
        assert_eq!(created, vec!["a", "b"]);
        let mut uploaded = api.small_uploads();
        uploaded.sort();
        let expected: Vec<String> = (0..5).map(|i| format!("photo{i}.jpg")).collect();
        assert_eq!(uploaded, expected);
        assert_eq!(status_of(&snaps, "a/b/photo3.jpg"), UploadStatus::Completed);
    }

    #[tokio::test]
    async fn identical_file_completes_without_transfer() {
        let mut f = fixture(small_config()).await;
        f.api.add_file(None, "same.txt", b"same bytes");
        let requests = vec![f.source("same.txt", b"same bytes")];

        let snaps = f.manager.upload_batch(requests, None).await;

        assert_eq!(snaps[0].status, UploadStatus::Completed);
        assert_eq!(f.api.transfer_calls(), 0);
        assert_eq!(f.api.links(), 0);
        while let Ok(event) = f.events.try_recv() {
            assert!(!matches!(event, UploadEvent::ConflictDetected { .. }));
            assert!(!matches!(event, UploadEvent::FolderChanged { .. }));
        }
    }

    #[tokio::test]
    async fn same_content_elsewhere_is_linked() {
        let f = fixture(small_config()).await;
        f.api.add_file(None, "orig.txt", b"shared content");
        let requests = vec![f.source("copy.txt", b"shared content")];
        let (api, _store, manager, _tmp) = f.spawn_drain();

        let snaps = manager.upload_batch(requests, None).await;

        assert_eq!(snaps[0].status, UploadStatus::Completed);
        assert_eq!(api.links(), 1);
        assert_eq!(api.transfer_calls(), 0);
    }

    async fn run_collision(resolution: ConflictResolution) -> (Fixture, TaskSnapshot) {
        let mut f = fixture(small_config()).await;
        f.api.add_file(None, "doc.txt", b"old");
        let requests = vec![f.source("doc.txt", b"new content")];

        let manager = Arc::clone(&f.manager);
        let batch = tokio::spawn(async move { manager.upload_batch(requests, None).await });

        let event = f
            .wait_for(|e| matches!(e, UploadEvent::ConflictDetected { .. }))
            .await;
        let UploadEvent::ConflictDetected { task_id, file_name, .. } = event else {
            unreachable!()
        };
        assert_eq!(file_name, "doc.txt");
        assert_eq!(f.api.transfer_calls(), 0);
        assert!(f.manager.resolve_conflict(&task_id, resolution));
        assert!(!f.manager.resolve_conflict(&task_id, resolution));

        let snaps = batch.await.unwrap();
        (f, snaps.into_iter().next().unwrap())
    }

    #[tokio::test]
    async fn declined_overwrite_fails_as_cancelled() {
        let (f, snap) = run_collision(ConflictResolution::Skip).await;
        assert_eq!(snap.status, UploadStatus::Error);
        assert_eq!(snap.error_message.as_deref(), Some("Cancelled"));
        assert_eq!(f.api.transfer_calls(), 0);
    }

    #[tokio::test]
    async fn accepted_overwrite_uploads() {
        let (f, snap) = run_collision(ConflictResolution::Overwrite).await;
        assert_eq!(snap.status, UploadStatus::Completed);
        assert_eq!(f.api.small_uploads(), vec!["doc.txt".to_string()]);
    }

    #[tokio::test]
    async fn pending_prompt_does_not_block_siblings() {
        let mut f = fixture(UploaderConfig {
            file_concurrency: 1,
            ..small_config()
        })
        .await;
        f.api.add_file(None, "clash.txt", b"old");
        let requests = vec![
            f.source("clash.txt", b"new"),
            f.source("other.txt", b"independent"),
        ];

        let manager = Arc::clone(&f.manager);
        let batch = tokio::spawn(async move { manager.upload_batch(requests, None).await });

        let UploadEvent::ConflictDetected { task_id, .. } = f
            .wait_for(|e| matches!(e, UploadEvent::ConflictDetected { .. }))
            .await
        else {
            unreachable!()
        };
        // The only worker moves on while the prompt is open.
        let prompted = task_id.clone();
        f.wait_for(|e| matches!(e, UploadEvent::Completed { task_id, .. } if *task_id != prompted))
            .await;

        f.manager.resolve_conflict(&task_id, ConflictResolution::Skip);
        let snaps = batch.await.unwrap();
        assert_eq!(status_of(&snaps, "clash.txt"), UploadStatus::Error);
        assert_eq!(status_of(&snaps, "other.txt"), UploadStatus::Completed);
    }

    #[tokio::test]
    async fn shutdown_releases_parked_prompts() {
        let mut f = fixture(small_config()).await;
        f.api.add_file(None, "doc.txt", b"old");
        let requests = vec![f.source("doc.txt", b"new")];

        let manager = Arc::clone(&f.manager);
        let batch = tokio::spawn(async move { manager.upload_batch(requests, None).await });
        f.wait_for(|e| matches!(e, UploadEvent::ConflictDetected { .. }))
            .await;

        f.manager.shutdown();
        let snaps = batch.await.unwrap();
        assert_eq!(snaps[0].status, UploadStatus::Cancelled);
        assert!(!f.manager.has_active_uploads());
    }

    #[tokio::test]
    async fn restricted_extension_fails_before_any_request() {
        let mut f = fixture(UploaderConfig {
            blocked_extensions: vec!["exe".into()],
            ..small_config()
        })
        .await;
        let requests = vec![f.source("setup.EXE", b"MZ"), f.source("ok.txt", b"fine")];

        let snaps = f.manager.upload_batch(requests, None).await;

        assert_eq!(status_of(&snaps, "setup.EXE"), UploadStatus::Error);
        assert_eq!(status_of(&snaps, "ok.txt"), UploadStatus::Completed);
        assert_eq!(f.api.small_uploads(), vec!["ok.txt".to_string()]);
        let failed = f
            .wait_for(|e| matches!(e, UploadEvent::Failed { .. }))
            .await;
        assert!(matches!(failed, UploadEvent::Failed { error, .. } if error.contains(".exe")));
    }

    #[tokio::test]
    async fn folder_failure_only_fails_that_branch() {
        let f = fixture(small_config()).await;
        f.api.fail_create_folder.store(true, Ordering::SeqCst);
        let requests = vec![f.source("sub/a.txt", b"a"), f.source("b.txt", b"b")];
        let (_api, _store, manager, _tmp) = f.spawn_drain();

        let snaps = manager.upload_batch(requests, None).await;

        assert_eq!(status_of(&snaps, "sub/a.txt"), UploadStatus::Error);
        assert_eq!(status_of(&snaps, "b.txt"), UploadStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_task_aborts_and_removes() {
        let mut f = fixture(UploaderConfig {
            small_file_threshold: 4,
            ..small_config()
        })
        .await;
        // 8-byte server chunks: 50 parts.
        let requests = vec![f.source("big.bin", &data(400))];

        let manager = Arc::clone(&f.manager);
        let batch = tokio::spawn(async move { manager.upload_batch(requests, None).await });

        let UploadEvent::Progress(snap) = f
            .wait_for(|e| {
                matches!(e, UploadEvent::Progress(s)
                    if s.status == UploadStatus::Uploading && s.progress_percent > 0)
            })
            .await
        else {
            unreachable!()
        };
        assert!(f.manager.has_active_uploads());
        assert!(f.manager.cancel_task(&snap.task_id).await);
        assert!(!f.manager.cancel_task(&snap.task_id).await);

        let snaps = batch.await.unwrap();
        assert!(snaps.is_empty());
        assert!(f.manager.snapshots().is_empty());
        assert!(!f.manager.has_active_uploads());
        assert_eq!(f.api.aborted().len(), 1);
        assert!(f.api.chunk_puts().len() < 50);
        assert!(f.store.list_metas().await.unwrap().is_empty());
        f.wait_for(|e| matches!(e, UploadEvent::Cancelled { .. }))
            .await;
    }

    #[tokio::test]
    async fn resume_runs_once_and_sends_only_missing_parts() {
        let f = fixture(small_config()).await;
        let source = f.tmp.path().join("resumed.bin");
        let bytes = data(32);
        std::fs::write(&source, &bytes).unwrap();

        let meta = UploadSessionMeta {
            upload_id: "up-1".into(),
            file_name: "resumed.bin".into(),
            file_type: None,
            total_size_bytes: 32,
            chunk_size_bytes: 8,
            total_chunks: 4,
            destination_folder_id: None,
            created_at: Utc::now(),
            source_path: Some(source.clone()),
            digest: String::new(),
        };
        f.store.persist_file(&meta, &source).await.unwrap();
        f.api.seed_session(
            "up-1",
            "resumed.bin",
            32,
            8,
            vec![(1, bytes[..8].to_vec()), (2, bytes[8..16].to_vec())],
        );
        let (api, store, manager, _tmp) = f.spawn_drain();

        let snaps = manager.resume_pending().await;
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].status, UploadStatus::Completed);
        let mut sent: Vec<u32> = api.chunk_puts().into_iter().map(|(_, p)| p).collect();
        sent.sort_unstable();
        assert_eq!(sent, vec![3, 4]);
        assert!(store.get_meta("up-1").await.unwrap().is_none());

        assert!(manager.resume_pending().await.is_empty());
    }

    #[tokio::test]
    async fn connect_opens_configured_store() {
        let tmp = tempfile::tempdir().unwrap();
        let config = UploaderConfig {
            store_dir: Some(tmp.path().join("uploads")),
            ..UploaderConfig::default()
        };
        let manager = UploadQueueManager::connect(config, Some("token")).await.unwrap();
        assert!(tmp.path().join("uploads").join("meta").is_dir());
        assert!(!manager.has_active_uploads());
    }

    #[tokio::test]
    async fn completion_after_cancel_is_not_reported() {
        let mut f = fixture(small_config()).await;
        let task = UploadTask::new("late.txt", f.tmp.path().join("late.txt"), 3);
        let task_id = task.id.clone();
        f.manager.tasks.insert(task);
        let handle = TaskHandle::new(
            &task_id,
            Arc::clone(&f.manager.tasks),
            f.manager.events.clone(),
        );
        assert!(handle.transition(UploadStatus::Cancelled));

        let finished = Finished {
            file_id: "file-1".into(),
            parent_id: None,
            changed: true,
        };
        f.manager.finish(&handle, Ok(finished)).await;

        assert_eq!(handle.status(), Some(UploadStatus::Cancelled));
        let mut folder_changed = false;
        while let Ok(event) = f.events.try_recv() {
            assert!(!matches!(event, UploadEvent::Completed { .. }));
            folder_changed |= matches!(event, UploadEvent::FolderChanged { .. });
        }
        assert!(folder_changed);
    }

    #[tokio::test]
    async fn finished_tasks_linger_then_disappear() {
        let f = fixture(UploaderConfig {
            task_linger_secs: 0,
            ..small_config()
        })
        .await;
        let requests = vec![f.source("a.txt", b"a")];
        let (_api, _store, manager, _tmp) = f.spawn_drain();

        let snaps = manager.upload_batch(requests, None).await;
        assert_eq!(snaps.len(), 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(manager.snapshots().is_empty());
    }
}
