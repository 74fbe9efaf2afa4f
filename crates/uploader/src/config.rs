//! Uploader configuration.
//!
//! Reads/writes JSON at `<config dir>/filedrop/uploader.json`. Every field
//! is optional on disk; missing fields take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use filedrop_transfer::{
    ContentHasher, DEFAULT_CHUNK_SIZE, HASH_SIZE_CEILING, HASH_SLICE_SIZE, RetryPolicy,
    SMALL_FILE_THRESHOLD,
};
use filedrop_upload_store::config_dir;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;

/// Environment variable overriding the client-side chunk size guess.
pub const CHUNK_SIZE_ENV: &str = "FILEDROP_CHUNK_SIZE";

/// Uploader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Base URL of the file backend.
    pub api_base_url: String,
    /// Chunk size used only until the server answers session init.
    pub default_chunk_size: u64,
    /// Files at or below this size use the single-request path.
    pub small_file_threshold: u64,
    /// Files above this size are not hashed (and never deduplicated).
    pub hash_size_ceiling: u64,
    pub hash_slice_size: usize,
    /// Files uploaded concurrently within one batch.
    pub file_concurrency: usize,
    /// Chunks uploaded concurrently within one file.
    pub chunk_concurrency: usize,
    /// Retries after the first chunk attempt.
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
    /// How long finished tasks stay visible.
    pub task_linger_secs: u64,
    /// Extensions rejected before any network call (without leading dot).
    pub blocked_extensions: Vec<String>,
    /// Directory of the local upload store; `None` uses the default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".into(),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            small_file_threshold: SMALL_FILE_THRESHOLD,
            hash_size_ceiling: HASH_SIZE_CEILING,
            hash_slice_size: HASH_SLICE_SIZE,
            file_concurrency: 3,
            chunk_concurrency: 3,
            max_retries: 3,
            retry_initial_delay_ms: 1000,
            task_linger_secs: 5,
            blocked_extensions: Vec::new(),
            store_dir: None,
        }
    }
}

impl UploaderConfig {
    /// Loads configuration from the default location.
    ///
    /// A missing or malformed file yields defaults (logged). The
    /// `FILEDROP_CHUNK_SIZE` environment variable, when valid, overrides the
    /// file's chunk size.
    pub fn load() -> Self {
        let mut config = match config_file_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        };
        config.apply_chunk_size_override(std::env::var(CHUNK_SIZE_ENV).ok().as_deref());
        config
    }

    /// Loads configuration from `path`, falling back to defaults.
    pub fn load_from(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read uploader config, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_str::<Self>(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse uploader config, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Saves configuration to the default location.
    pub fn save(&self) -> Result<(), UploadError> {
        let path = config_file_path().ok_or(UploadError::NoConfigDir)?;
        self.save_to(&path)
    }

    /// Saves configuration to `path` as pretty JSON.
    pub fn save_to(&self, path: &Path) -> Result<(), UploadError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "uploader configuration saved");
        Ok(())
    }

    /// Applies a chunk size override (in bytes). Invalid or zero values are
    /// ignored.
    pub fn apply_chunk_size_override(&mut self, value: Option<&str>) {
        let Some(raw) = value else { return };
        match raw.trim().parse::<u64>() {
            Ok(size) if size > 0 => self.default_chunk_size = size,
            _ => tracing::warn!(value = raw, "ignoring invalid {CHUNK_SIZE_ENV}"),
        }
    }

    /// Retry schedule for chunk transfers.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn content_hasher(&self) -> ContentHasher {
        ContentHasher::new(self.hash_slice_size, self.hash_size_ceiling)
    }

    pub fn task_linger(&self) -> Duration {
        Duration::from_secs(self.task_linger_secs)
    }

    /// Picks the chunk size for a new session: the server's value wins when
    /// present, otherwise the configured guess.
    pub fn effective_chunk_size(&self, server_chunk_size: i64) -> u64 {
        match u64::try_from(server_chunk_size) {
            Ok(size) if size > 0 => size,
            _ => self.default_chunk_size.max(1),
        }
    }
}

/// Path of the config file, if a config directory is known.
pub fn config_file_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("filedrop").join("uploader.json"))
}
