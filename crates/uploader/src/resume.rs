//! Reconciliation of server-side pending sessions with local state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use filedrop_api::UploadApi;
use filedrop_protocol::messages::PendingSession;
use filedrop_upload_store::{LocalUploadStore, UploadSessionMeta};
use tracing::{debug, info, warn};

use crate::error::UploadError;

/// Sessions older than this are expired by the backend.
pub const DEFAULT_ORPHAN_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// A session that can be continued from local chunks.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub meta: UploadSessionMeta,
    /// Parts the server already holds; never sent again.
    pub uploaded_parts: Vec<u32>,
}

impl ResumePlan {
    /// Parts still to send.
    pub fn missing_parts(&self) -> Vec<u32> {
        self.meta
            .parts()
            .filter(|p| !self.uploaded_parts.contains(p))
            .collect()
    }
}

/// Matches server pending sessions against the local store.
pub struct ResumeCoordinator {
    api: Arc<dyn UploadApi>,
    store: Arc<LocalUploadStore>,
}

impl ResumeCoordinator {
    pub fn new(api: Arc<dyn UploadApi>, store: Arc<LocalUploadStore>) -> Self {
        Self { api, store }
    }

    /// Returns the sessions that both the server still tracks and the local
    /// store can complete.
    ///
    /// Failure to fetch either side is logged and yields no plans. Local
    /// sessions unknown to the server are left untouched.
    pub async fn plan(&self) -> Vec<ResumePlan> {
        let pending = match self.api.list_pending_sessions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to fetch pending sessions, nothing to resume");
                return Vec::new();
            }
        };
        let metas = match self.store.list_metas().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to read local upload state, nothing to resume");
                return Vec::new();
            }
        };

        let by_id: HashMap<&str, &PendingSession> =
            pending.iter().map(|p| (p.upload_id.as_str(), p)).collect();

        let mut plans = Vec::new();
        let mut orphans = 0usize;
        for meta in metas {
            let Some(server) = by_id.get(meta.upload_id.as_str()) else {
                orphans += 1;
                continue;
            };
            if let Some(plan) = self.reconcile(meta, server).await {
                plans.push(plan);
            }
        }

        info!(resumable = plans.len(), orphans, "reconciled pending uploads");
        plans
    }

    async fn reconcile(&self, meta: UploadSessionMeta, server: &PendingSession) -> Option<ResumePlan> {
        if i64::from(meta.total_chunks) != i64::from(server.total_chunks) {
            warn!(
                upload_id = %meta.upload_id,
                local = meta.total_chunks,
                server = server.total_chunks,
                "chunk count mismatch, not resuming"
            );
            return None;
        }

        let uploaded_parts: Vec<u32> = server
            .uploaded_parts
            .iter()
            .filter_map(|p| u32::try_from(*p).ok())
            .filter(|p| (1..=meta.total_chunks).contains(p))
            .collect();
        let plan = ResumePlan {
            meta,
            uploaded_parts,
        };

        let local = match self.store.chunk_parts(&plan.meta.upload_id).await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(upload_id = %plan.meta.upload_id, error = %e, "failed to list local chunks");
                return None;
            }
        };
        if let Some(part) = plan.missing_parts().into_iter().find(|p| !local.contains(p)) {
            warn!(upload_id = %plan.meta.upload_id, part, "local chunk missing, not resumable");
            return None;
        }

        debug!(
            upload_id = %plan.meta.upload_id,
            server_parts = plan.uploaded_parts.len(),
            total = plan.meta.total_chunks,
            "session resumable"
        );
        Some(plan)
    }

    /// Deletes local sessions the server no longer tracks and that are older
    /// than `max_age`. Returns the purged upload ids.
    ///
    /// Unlike [`plan`](Self::plan), a failed server listing is an error:
    /// nothing is deleted without knowing what the server still holds.
    pub async fn purge_orphans(&self, max_age: Duration) -> Result<Vec<String>, UploadError> {
        let pending = self.api.list_pending_sessions().await?;
        let metas = self.store.list_metas().await?;
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let mut purged = Vec::new();
        for meta in metas {
            let tracked = pending.iter().any(|p| p.upload_id == meta.upload_id);
            if tracked || meta.age(now) <= max_age {
                continue;
            }
            self.store.delete_session(&meta.upload_id).await?;
            info!(upload_id = %meta.upload_id, "purged orphaned upload");
            purged.push(meta.upload_id);
        }
        Ok(purged)
    }
}
