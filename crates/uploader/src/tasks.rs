//! Shared task table and the per-task handle used by pipeline stages.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use filedrop_protocol::UploadStatus;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::types::{TaskSnapshot, UploadEvent, UploadTask};

/// Sending side of the manager's event channel.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<UploadEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<UploadEvent>) -> Self {
        Self { tx }
    }

    /// Progress updates are lossy: when the host lags behind, they are
    /// dropped rather than stalling transfers.
    pub(crate) fn progress(&self, snapshot: TaskSnapshot) {
        if self.tx.try_send(UploadEvent::Progress(snapshot)).is_err() {
            trace!("event channel full or closed, dropping progress update");
        }
    }

    pub(crate) async fn send(&self, event: UploadEvent) {
        let _ = self.tx.send(event).await;
    }
}

/// Tasks in submission order.
#[derive(Default)]
pub(crate) struct TaskTable {
    tasks: Mutex<Vec<UploadTask>>,
}

impl TaskTable {
    fn lock(&self) -> MutexGuard<'_, Vec<UploadTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn insert(&self, task: UploadTask) {
        self.lock().push(task);
    }

    /// Runs `f` on the task with `id`, if still present.
    pub(crate) fn with<R>(&self, id: &str, f: impl FnOnce(&mut UploadTask) -> R) -> Option<R> {
        self.lock().iter_mut().find(|t| t.id == id).map(f)
    }

    pub(crate) fn remove(&self, id: &str) -> Option<UploadTask> {
        let mut tasks = self.lock();
        let idx = tasks.iter().position(|t| t.id == id)?;
        Some(tasks.remove(idx))
    }

    pub(crate) fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.with(id, |t| t.snapshot())
    }

    pub(crate) fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.lock().iter().map(UploadTask::snapshot).collect()
    }

    pub(crate) fn any_active(&self) -> bool {
        self.lock().iter().any(|t| t.status().is_active())
    }

    /// Drops terminal tasks that finished more than `linger` ago.
    pub(crate) fn prune_finished(&self, linger: Duration) -> usize {
        let now = Instant::now();
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|t| match t.finished_at() {
            Some(at) => now.duration_since(at) < linger,
            None => true,
        });
        before - tasks.len()
    }
}

/// Handle to one task: mutates it in the table and reports changes.
#[derive(Clone)]
pub(crate) struct TaskHandle {
    id: String,
    tasks: Arc<TaskTable>,
    events: EventSink,
}

impl TaskHandle {
    pub(crate) fn new(id: impl Into<String>, tasks: Arc<TaskTable>, events: EventSink) -> Self {
        Self {
            id: id.into(),
            tasks,
            events,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> Option<UploadStatus> {
        self.tasks.with(&self.id, |t| t.status())
    }

    pub(crate) fn snapshot(&self) -> Option<TaskSnapshot> {
        self.tasks.snapshot(&self.id)
    }

    pub(crate) fn transition(&self, next: UploadStatus) -> bool {
        self.update(|t| t.transition(next))
    }

    pub(crate) fn fail(&self, message: &str) -> bool {
        self.update(|t| t.fail(message))
    }

    pub(crate) fn progress(&self, percent: u8) {
        self.update(|t| t.set_progress(percent));
    }

    pub(crate) fn set_server_upload_id(&self, upload_id: &str) {
        self.update(|t| {
            t.set_server_upload_id(upload_id);
            true
        });
    }

    /// Applies `f` and emits a progress event when it reports a change.
    fn update(&self, f: impl FnOnce(&mut UploadTask) -> bool) -> bool {
        let changed = self
            .tasks
            .with(&self.id, |t| f(t).then(|| t.snapshot()))
            .flatten();
        match changed {
            Some(snapshot) => {
                self.events.progress(snapshot);
                true
            }
            None => false,
        }
    }
}
