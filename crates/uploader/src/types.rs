//! Task, request and event types for the upload pipeline.

use std::path::PathBuf;

use filedrop_protocol::{UploadProgress, UploadStatus};
use tokio::time::Instant;
use tracing::debug;

/// One file handed to [`UploadQueueManager::upload_batch`](crate::UploadQueueManager::upload_batch).
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Local file to read.
    pub path: PathBuf,
    /// Slash-delimited path relative to the destination folder, including
    /// the file name (e.g. `"photos/2024/img.jpg"`).
    pub relative_path: String,
}

impl UploadRequest {
    pub fn new(path: impl Into<PathBuf>, relative_path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            relative_path: relative_path.into(),
        }
    }
}

/// Answer to a [`UploadEvent::ConflictDetected`] prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Upload anyway; the backend merges same-name files.
    Overwrite,
    /// Leave the existing file alone; the task fails with "Cancelled".
    Skip,
}

/// Events emitted by the queue manager.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Status or progress of a task changed.
    Progress(UploadProgress),
    /// A same-name file with different content exists at the destination.
    /// The task waits until the host calls `resolve_conflict`.
    ConflictDetected {
        task_id: String,
        file_name: String,
        folder_id: Option<String>,
        existing_file_id: String,
    },
    /// A task finished successfully.
    Completed {
        task_id: String,
        file_id: Option<String>,
    },
    /// A task failed.
    Failed { task_id: String, error: String },
    /// A task was cancelled by the user.
    Cancelled { task_id: String },
    /// The listing of a folder changed (`None` = root).
    FolderChanged { folder_id: Option<String> },
}

/// Point-in-time view of a task handed to UI layers.
pub type TaskSnapshot = UploadProgress;

/// One file's journey through the pipeline.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: String,
    /// Relative path shown to the user.
    pub display_name: String,
    pub source: PathBuf,
    pub size_bytes: u64,
    status: UploadStatus,
    progress_percent: u8,
    error_message: Option<String>,
    server_upload_id: Option<String>,
    finished_at: Option<Instant>,
}

impl UploadTask {
    /// Creates a queued task with a fresh id.
    pub fn new(display_name: impl Into<String>, source: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            source: source.into(),
            size_bytes,
            status: UploadStatus::Queued,
            progress_percent: 0,
            error_message: None,
            server_upload_id: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn progress_percent(&self) -> u8 {
        self.progress_percent
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn server_upload_id(&self) -> Option<&str> {
        self.server_upload_id.as_deref()
    }

    /// When the task reached a terminal state.
    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// Returns `false` (and changes nothing) for illegal moves, including
    /// any move out of a terminal state.
    pub fn transition(&mut self, next: UploadStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            debug!(task = %self.id, from = ?self.status, to = ?next, "ignoring illegal transition");
            return false;
        }

        self.status = next;
        match next {
            UploadStatus::Hashing | UploadStatus::Uploading => self.progress_percent = 0,
            UploadStatus::Processing => self.progress_percent = 99,
            UploadStatus::Completed => self.progress_percent = 100,
            _ => {}
        }
        if next.is_terminal() {
            self.finished_at = Some(Instant::now());
        }
        true
    }

    /// Moves to `Error` with `message`.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if !self.transition(UploadStatus::Error) {
            return false;
        }
        self.error_message = Some(message.into());
        true
    }

    /// Updates progress while hashing or uploading. Capped at 99.
    ///
    /// Returns `true` if the stored value changed.
    pub fn set_progress(&mut self, percent: u8) -> bool {
        if !matches!(self.status, UploadStatus::Hashing | UploadStatus::Uploading) {
            return false;
        }
        let percent = percent.min(99);
        if percent == self.progress_percent {
            return false;
        }
        self.progress_percent = percent;
        true
    }

    pub fn set_server_upload_id(&mut self, upload_id: impl Into<String>) {
        self.server_upload_id = Some(upload_id.into());
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        UploadProgress {
            task_id: self.id.clone(),
            display_name: self.display_name.clone(),
            size_bytes: self.size_bytes,
            status: self.status,
            progress_percent: self.progress_percent,
            error_message: self.error_message.clone(),
            server_upload_id: self.server_upload_id.clone(),
        }
    }
}
