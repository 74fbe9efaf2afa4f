use serde::{Deserialize, Serialize};

/// Lifecycle state of one upload task.
///
/// `Completed`, `Error` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Hashing,
    Uploading,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl UploadStatus {
    /// Returns `true` for states that are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Returns `true` while work is pending or in flight.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Returns `true` if moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled) => true,
            (Queued, Hashing | Uploading | Completed | Error) => true,
            (Hashing, Uploading | Completed | Error) => true,
            (Uploading, Processing | Completed | Error) => true,
            (Processing, Completed | Error) => true,
            _ => false,
        }
    }
}

/// Point-in-time view of a task, suitable for a UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub task_id: String,
    pub display_name: String,
    pub size_bytes: u64,
    pub status: UploadStatus,
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_upload_id: Option<String>,
}
