//! Client-side upload pipeline.
//!
//! [`UploadQueueManager`] is the entry point: it takes batches of local
//! files, mirrors their folder structure at the destination, skips or links
//! content the backend already holds, asks the host about same-name
//! collisions and uploads the rest. Files above the small-file threshold are
//! split into chunks that are persisted locally before transfer, so an
//! interrupted upload can be resumed with [`UploadQueueManager::resume_pending`]
//! after a restart.
//!
//! The backend is reached only through [`filedrop_api::UploadApi`].

mod config;
pub mod dedup;
mod error;
mod folders;
#[cfg(test)]
mod mock;
mod queue;
mod resume;
mod session;
mod tasks;
pub mod transport;
mod types;

pub use config::{CHUNK_SIZE_ENV, UploaderConfig, config_file_path};
pub use error::UploadError;
pub use folders::FolderResolver;
pub use queue::UploadQueueManager;
pub use resume::{DEFAULT_ORPHAN_AGE, ResumeCoordinator, ResumePlan};
pub use transport::{ChunkTransport, PercentFn};
pub use types::{
    ConflictResolution, TaskSnapshot, UploadEvent, UploadRequest, UploadTask,
};
