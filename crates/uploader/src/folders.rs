//! Destination folder resolution with a per-batch cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use filedrop_api::UploadApi;
use filedrop_protocol::messages::CreateFolderRequest;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::UploadError;

/// Resolves relative directories below one root folder, creating missing
/// folders on the way.
///
/// Every resolved prefix is cached, so files sharing a directory cause at
/// most one create call per distinct folder. Meant to live for one batch.
pub struct FolderResolver<'a> {
    api: &'a dyn UploadApi,
    root: Option<String>,
    /// Prefix (`"a"`, `"a/b"`) → folder id. Workers racing on one prefix
    /// share its cell; different prefixes resolve independently.
    cache: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
}

impl<'a> FolderResolver<'a> {
    /// Creates a resolver below `root` (`None` = the user's root folder).
    pub fn new(api: &'a dyn UploadApi, root: Option<String>) -> Self {
        Self {
            api,
            root,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// Returns the id of the deepest folder of `segments`, creating missing
    /// folders in order. Empty `segments` resolve to the root.
    pub async fn ensure_folder_exists(
        &self,
        segments: &[String],
    ) -> Result<Option<String>, UploadError> {
        if segments.is_empty() {
            return Ok(self.root.clone());
        }

        let mut parent = self.root.clone();
        let mut prefix = String::new();

        for segment in segments {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);

            let cell = self.cell(&prefix);
            let id = cell
                .get_or_try_init(|| async {
                    let id = self.create_or_find(parent.as_deref(), segment).await?;
                    debug!(path = %prefix, folder_id = %id, "resolved folder");
                    Ok::<_, UploadError>(id)
                })
                .await?
                .clone();
            parent = Some(id);
        }

        Ok(parent)
    }

    /// The cache slot for `prefix`. The map lock is never held across a
    /// request.
    fn cell(&self, prefix: &str) -> Arc<OnceCell<String>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(cache.entry(prefix.to_string()).or_default())
    }

    /// Creates `name` under `parent`; on failure looks for an existing folder
    /// of that name before giving up.
    async fn create_or_find(&self, parent: Option<&str>, name: &str) -> Result<String, UploadError> {
        let req = CreateFolderRequest {
            name: name.to_string(),
            parent_id: parent.map(str::to_string),
        };
        let create_err = match self.api.create_folder(&req).await {
            Ok(folder) => return Ok(folder.id),
            Err(e) => e,
        };

        debug!(folder = name, error = %create_err, "create failed, looking for existing folder");
        match self.api.list_folder(parent).await {
            Ok(entries) => {
                if let Some(existing) = entries
                    .into_iter()
                    .find(|e| e.is_folder && e.filename == name)
                {
                    return Ok(existing.id);
                }
            }
            Err(e) => warn!(folder = name, error = %e, "listing parent failed"),
        }

        Err(UploadError::FolderUnavailable {
            name: name.to_string(),
            source: create_err,
        })
    }
}
