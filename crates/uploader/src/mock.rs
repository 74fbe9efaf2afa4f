//! In-memory backend used by the pipeline tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use filedrop_api::{ApiError, ApiFuture, ProgressFn, SmallUpload, UploadApi};
use filedrop_protocol::messages::{
    CompleteUploadRequest, CreateFolderRequest, FileEntry, FileResponse, InitUploadRequest,
    InitUploadResponse, LinkFileRequest, PendingSession, PreCheckRequest, PreCheckResponse,
    UploadPartResponse, UploadResponse,
};
use filedrop_transfer::{digest_bytes, total_chunks};

struct MockSession {
    file_name: String,
    file_type: Option<String>,
    total_size: u64,
    chunk_size: u64,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct MockState {
    next_id: u32,
    files: Vec<FileEntry>,
    sessions: HashMap<String, MockSession>,
    inits: Vec<InitUploadRequest>,
    chunk_puts: Vec<(String, u32)>,
    small_uploads: Vec<String>,
    folder_creates: Vec<String>,
    aborted: Vec<String>,
    completes: Vec<(String, CompleteUploadRequest)>,
    links: u32,
    active: HashMap<String, usize>,
    max_active_files: usize,
    max_active_chunks: usize,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// Fake backend with call counters and an active-transfer gauge.
pub(crate) struct MockApi {
    state: Mutex<MockState>,
    chunk_size: i64,
    delay: Duration,
    chunk_failures: AtomicU32,
    pub fail_chunks: AtomicBool,
    pub fail_complete: AtomicBool,
    pub fail_create_folder: AtomicBool,
    pub fail_list_sessions: AtomicBool,
}

/// Decrements the gauge when a transfer call ends (or is dropped).
struct ActiveGuard<'a> {
    api: &'a MockApi,
    key: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut s = self.api.lock();
        if let Some(n) = s.active.get_mut(&self.key) {
            *n -= 1;
            if *n == 0 {
                s.active.remove(&self.key);
            }
        }
    }
}

fn api_err(status: u16, body: impl Into<String>) -> ApiError {
    ApiError::Api {
        status,
        body: body.into(),
    }
}

impl MockApi {
    pub(crate) fn new(chunk_size: i64) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            chunk_size,
            delay: Duration::from_millis(10),
            chunk_failures: AtomicU32::new(0),
            fail_chunks: AtomicBool::new(false),
            fail_complete: AtomicBool::new(false),
            fail_create_folder: AtomicBool::new(false),
            fail_list_sessions: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn enter(&self, key: &str) -> ActiveGuard<'_> {
        let mut s = self.lock();
        *s.active.entry(key.to_string()).or_default() += 1;
        let files = s.active.len();
        let chunks = s.active.values().copied().max().unwrap_or(0);
        s.max_active_files = s.max_active_files.max(files);
        s.max_active_chunks = s.max_active_chunks.max(chunks);
        ActiveGuard {
            api: self,
            key: key.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Seeding
    // -----------------------------------------------------------------------

    /// Adds a stored file whose digest is computed from `data`.
    pub(crate) fn add_file(&self, parent_id: Option<&str>, name: &str, data: &[u8]) -> String {
        let mut s = self.lock();
        let id = s.next_id("file");
        s.files.push(FileEntry {
            id: id.clone(),
            filename: name.into(),
            size: Some(data.len() as i64),
            mime_type: None,
            is_folder: false,
            parent_id: parent_id.map(str::to_string),
            hash: Some(digest_bytes(data)),
        });
        id
    }

    pub(crate) fn add_folder(&self, parent_id: Option<&str>, name: &str) -> String {
        let mut s = self.lock();
        let id = s.next_id("folder");
        s.files.push(folder_entry(&id, name, parent_id));
        id
    }

    /// Registers a server session that already holds `parts`.
    pub(crate) fn seed_session(
        &self,
        upload_id: &str,
        file_name: &str,
        total_size: u64,
        chunk_size: u64,
        parts: Vec<(u32, Vec<u8>)>,
    ) {
        self.lock().sessions.insert(
            upload_id.into(),
            MockSession {
                file_name: file_name.into(),
                file_type: None,
                total_size,
                chunk_size,
                parts: parts.into_iter().collect(),
            },
        );
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub(crate) fn chunk_puts(&self) -> Vec<(String, u32)> {
        self.lock().chunk_puts.clone()
    }

    pub(crate) fn inits(&self) -> Vec<InitUploadRequest> {
        self.lock().inits.clone()
    }

    pub(crate) fn small_uploads(&self) -> Vec<String> {
        self.lock().small_uploads.clone()
    }

    /// Chunk PUTs plus single-request uploads.
    pub(crate) fn transfer_calls(&self) -> usize {
        let s = self.lock();
        s.chunk_puts.len() + s.small_uploads.len()
    }

    pub(crate) fn folder_creates(&self) -> Vec<String> {
        self.lock().folder_creates.clone()
    }

    pub(crate) fn aborted(&self) -> Vec<String> {
        self.lock().aborted.clone()
    }

    pub(crate) fn completes(&self) -> Vec<(String, CompleteUploadRequest)> {
        self.lock().completes.clone()
    }

    pub(crate) fn links(&self) -> u32 {
        self.lock().links
    }

    pub(crate) fn max_active_files(&self) -> usize {
        self.lock().max_active_files
    }

    pub(crate) fn max_active_chunks(&self) -> usize {
        self.lock().max_active_chunks
    }

    pub(crate) fn files_in(&self, parent_id: Option<&str>) -> Vec<FileEntry> {
        self.lock()
            .files
            .iter()
            .filter(|f| f.parent_id.as_deref() == parent_id)
            .cloned()
            .collect()
    }

    fn store_file(
        &self,
        parent_id: Option<String>,
        name: &str,
        mime_type: Option<String>,
        data: &[u8],
    ) -> FileEntry {
        let mut s = self.lock();
        let id = s.next_id("file");
        let entry = FileEntry {
            id,
            filename: name.into(),
            size: Some(data.len() as i64),
            mime_type,
            is_folder: false,
            parent_id,
            hash: Some(digest_bytes(data)),
        };
        s.files.push(entry.clone());
        entry
    }
}

fn folder_entry(id: &str, name: &str, parent_id: Option<&str>) -> FileEntry {
    FileEntry {
        id: id.into(),
        filename: name.into(),
        size: None,
        mime_type: None,
        is_folder: true,
        parent_id: parent_id.map(str::to_string),
        hash: None,
    }
}

fn file_response(entry: &FileEntry) -> FileResponse {
    FileResponse {
        id: entry.id.clone(),
        name: entry.filename.clone(),
        is_folder: entry.is_folder,
        size: entry.size,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        mime_type: entry.mime_type.clone(),
        parent_id: entry.parent_id.clone(),
    }
}

impl UploadApi for MockApi {
    fn upload_small<'a>(
        &'a self,
        upload: SmallUpload<'a>,
        progress: ProgressFn,
    ) -> ApiFuture<'a, UploadResponse> {
        Box::pin(async move {
            let _active = self.enter(upload.file_name);
            self.lock().small_uploads.push(upload.file_name.to_string());
            tokio::time::sleep(self.delay).await;

            let data = tokio::fs::read(upload.path).await?;
            progress(data.len() as u64);
            let entry = self.store_file(
                upload.parent_id.map(str::to_string),
                upload.file_name,
                Some(upload.mime_type.to_string()),
                &data,
            );
            Ok(UploadResponse {
                file_id: entry.id,
                filename: entry.filename,
                expires_at: None,
            })
        })
    }

    fn init_upload<'a>(&'a self, req: &'a InitUploadRequest) -> ApiFuture<'a, InitUploadResponse> {
        Box::pin(async move {
            let mut s = self.lock();
            s.inits.push(req.clone());
            let upload_id = s.next_id("upload");
            s.sessions.insert(
                upload_id.clone(),
                MockSession {
                    file_name: req.file_name.clone(),
                    file_type: req.file_type.clone(),
                    total_size: req.total_size as u64,
                    chunk_size: self.chunk_size as u64,
                    parts: BTreeMap::new(),
                },
            );
            Ok(InitUploadResponse {
                key: format!("uploads/{upload_id}"),
                upload_id,
                chunk_size: self.chunk_size,
            })
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        upload_id: &'a str,
        part: u32,
        data: &'a [u8],
        progress: ProgressFn,
    ) -> ApiFuture<'a, UploadPartResponse> {
        Box::pin(async move {
            let _active = self.enter(upload_id);
            self.lock().chunk_puts.push((upload_id.to_string(), part));
            tokio::time::sleep(self.delay).await;

            if self.fail_chunks.load(Ordering::SeqCst) {
                let n = self.chunk_failures.fetch_add(1, Ordering::SeqCst) + 1;
                return Err(api_err(503, format!("chunk store unavailable ({n})")));
            }

            progress(data.len() as u64);
            let mut s = self.lock();
            let session = s
                .sessions
                .get_mut(upload_id)
                .ok_or_else(|| api_err(404, "no such session"))?;
            session.parts.insert(part, data.to_vec());
            Ok(UploadPartResponse {
                etag: format!("\"{upload_id}-{part}\""),
            })
        })
    }

    fn complete_upload<'a>(
        &'a self,
        upload_id: &'a str,
        req: &'a CompleteUploadRequest,
    ) -> ApiFuture<'a, FileResponse> {
        Box::pin(async move {
            self.lock()
                .completes
                .push((upload_id.to_string(), req.clone()));
            if self.fail_complete.load(Ordering::SeqCst) {
                return Err(api_err(500, "assembly failed"));
            }

            let session = self
                .lock()
                .sessions
                .remove(upload_id)
                .ok_or_else(|| api_err(404, "no such session"))?;
            let expected = total_chunks(session.total_size, session.chunk_size);
            if session.parts.len() as u32 != expected {
                return Err(api_err(400, "missing parts"));
            }

            let data: Vec<u8> = session.parts.into_values().flatten().collect();
            let entry = self.store_file(
                req.parent_id.clone(),
                &session.file_name,
                session.file_type,
                &data,
            );
            Ok(file_response(&entry))
        })
    }

    fn abort_upload<'a>(&'a self, upload_id: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let mut s = self.lock();
            s.aborted.push(upload_id.to_string());
            s.sessions.remove(upload_id);
            Ok(())
        })
    }

    fn list_pending_sessions(&self) -> ApiFuture<'_, Vec<PendingSession>> {
        Box::pin(async move {
            if self.fail_list_sessions.load(Ordering::SeqCst) {
                return Err(api_err(502, "sessions unavailable"));
            }
            let s = self.lock();
            Ok(s.sessions
                .iter()
                .map(|(id, session)| PendingSession {
                    upload_id: id.clone(),
                    file_name: session.file_name.clone(),
                    file_type: session.file_type.clone(),
                    total_size: session.total_size as i64,
                    chunk_size: session.chunk_size as i64,
                    total_chunks: total_chunks(session.total_size, session.chunk_size) as i32,
                    uploaded_chunks: session.parts.len() as i32,
                    uploaded_parts: session.parts.keys().map(|p| *p as i32).collect(),
                    created_at: None,
                })
                .collect())
        })
    }

    fn pre_check<'a>(&'a self, req: &'a PreCheckRequest) -> ApiFuture<'a, PreCheckResponse> {
        Box::pin(async move {
            let s = self.lock();
            let found = s.files.iter().find(|f| {
                !f.is_folder
                    && f.hash.as_deref() == Some(req.full_hash.as_str())
                    && f.size == Some(req.size)
            });
            Ok(PreCheckResponse {
                exists: found.is_some(),
                upload_token: None,
                file_id: found.map(|f| f.id.clone()),
            })
        })
    }

    fn link_file<'a>(&'a self, req: &'a LinkFileRequest) -> ApiFuture<'a, UploadResponse> {
        Box::pin(async move {
            let mut s = self.lock();
            let source = s
                .files
                .iter()
                .find(|f| f.id == req.storage_file_id)
                .cloned()
                .ok_or_else(|| api_err(404, "no such stored file"))?;
            let id = s.next_id("file");
            s.files.push(FileEntry {
                id: id.clone(),
                filename: req.filename.clone(),
                parent_id: req.parent_id.clone(),
                ..source
            });
            s.links += 1;
            Ok(UploadResponse {
                file_id: id,
                filename: req.filename.clone(),
                expires_at: None,
            })
        })
    }

    fn create_folder<'a>(&'a self, req: &'a CreateFolderRequest) -> ApiFuture<'a, FileResponse> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            let mut s = self.lock();
            s.folder_creates.push(req.name.clone());
            if self.fail_create_folder.load(Ordering::SeqCst) {
                return Err(api_err(500, "create failed"));
            }
            let exists = s.files.iter().any(|f| {
                f.is_folder && f.filename == req.name && f.parent_id == req.parent_id
            });
            if exists {
                return Err(api_err(409, "folder already exists"));
            }

            let id = s.next_id("folder");
            let entry = folder_entry(&id, &req.name, req.parent_id.as_deref());
            s.files.push(entry.clone());
            Ok(file_response(&entry))
        })
    }

    fn list_folder<'a>(&'a self, parent_id: Option<&'a str>) -> ApiFuture<'a, Vec<FileEntry>> {
        Box::pin(async move { Ok(self.files_in(parent_id)) })
    }
}
