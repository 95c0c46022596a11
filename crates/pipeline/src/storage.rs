//! The object-storage boundary.
//!
//! Artifacts staged in a scratch directory are exported here before the
//! entry is acknowledged. Upload internals (auth, containers, segmenting)
//! live behind the trait.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use roadwatch_core::ArtifactDescriptor;

/// Failure raised by an artifact store implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("read artifact: {0}")]
    Read(#[from] std::io::Error),

    #[error("upload failed: {0}")]
    Upload(String),
}

/// Destination for produced artifacts.
///
/// `prefix` is the object-key prefix for this job
/// (`{upload_prefix}{cctv_id}/{job_id}/{timestamp}`); the returned keys are
/// the stored object names.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(
        &self,
        artifacts: &[ArtifactDescriptor],
        prefix: &str,
    ) -> Result<Vec<String>, StorageError>;
}

/// No-op store: logs what would have been uploaded and stores nothing.
#[derive(Debug, Default)]
pub struct NullArtifactStore;

#[async_trait]
impl ArtifactStore for NullArtifactStore {
    async fn upload(
        &self,
        artifacts: &[ArtifactDescriptor],
        prefix: &str,
    ) -> Result<Vec<String>, StorageError> {
        info!(
            prefix = %prefix,
            count = artifacts.len(),
            "artifact upload skipped (null store)"
        );
        Ok(Vec::new())
    }
}
