//! `roadwatch-pipeline` — collaborator boundaries around the worker core.
//!
//! The worker drives three external capabilities it deliberately knows
//! nothing about: the video-analysis pipeline, the artifact store, and the
//! resource guard. Each is a narrow trait here, together with the stand-in
//! implementations used in development and tests.

pub mod guard;
pub mod processor;
pub mod storage;

pub use guard::{DisabledGuard, ResourceGuard, SystemMemoryGuard};
pub use processor::{JobProcessor, PreprocessOnlyProcessor, ProcessError, ProcessRequest};
pub use storage::{ArtifactStore, NullArtifactStore, StorageError};
