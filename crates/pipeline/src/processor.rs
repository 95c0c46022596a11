//! The analysis-pipeline boundary.
//!
//! The worker hands a [`ProcessRequest`] across this seam and gets back a
//! [`ProcessReport`] classifying what happened. Everything behind the trait
//! (codec probing, background extraction, damage detection) is opaque to the
//! delivery engine and may be arbitrarily slow.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::info;

use roadwatch_core::{ArtifactDescriptor, ProcessReport, ProcessStatus};

/// Inputs for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    /// Camera identifier, used in artifact naming.
    pub cctv_id: String,
    /// Stream/playlist URL to analyze.
    pub source_url: String,
    /// Seconds of footage to capture.
    pub duration_seconds: u32,
    /// Job identifier for logs and upload paths.
    pub job_id: String,
}

/// Failure raised by a pipeline implementation.
///
/// Anything surfacing here is a processing failure from the worker's point
/// of view and consumes attempt budget; a reachable-but-unhealthy source
/// should instead be reported via [`ProcessStatus::UpstreamUnreachable`].
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("scratch dir: {0}")]
    Scratch(#[from] std::io::Error),

    #[error("report serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("pipeline failure: {0}")]
    Pipeline(String),
}

/// The analysis pipeline the worker invokes once per delivered entry.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, request: &ProcessRequest) -> Result<ProcessReport, ProcessError>;
}

/// Stand-in pipeline: no inference, just a scratch dir with the request
/// metadata staged as an artifact.
///
/// Useful for wiring tests and for deployments where inference runs
/// elsewhere and only the delivery machinery is being exercised.
#[derive(Debug, Default)]
pub struct PreprocessOnlyProcessor;

#[async_trait]
impl JobProcessor for PreprocessOnlyProcessor {
    async fn process(&self, request: &ProcessRequest) -> Result<ProcessReport, ProcessError> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!(
                "preprocess_{}_{}_",
                request.cctv_id, request.job_id
            ))
            .tempdir()?
            .keep();

        let meta = serde_json::json!({
            "cctv_id": request.cctv_id,
            "job_id": request.job_id,
            "hls_url": request.source_url,
            "duration_seconds": request.duration_seconds,
            "processing_timestamp": Utc::now().to_rfc3339(),
            "processing_mode": "preprocessing_only",
        });

        let meta_path = scratch.join("process_meta.json");
        fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)?;

        info!(
            cctv_id = %request.cctv_id,
            job_id = %request.job_id,
            scratch = %scratch.display(),
            "preprocess-only run staged"
        );

        let mut report = ProcessReport::new(ProcessStatus::PartialSuccess);
        report.artifacts.push(ArtifactDescriptor {
            kind: "process_metadata".to_string(),
            path: meta_path,
            filename: "process_meta.json".to_string(),
        });
        report.meta = meta;
        report.scratch_dir = Some(scratch);
        Ok(report)
    }
}

/// Remove a scratch directory, swallowing (but logging) failures. Cleanup
/// runs on every exit path, so it must never propagate.
pub fn cleanup_scratch(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), error = %e, "scratch cleanup failed");
        }
    }
}
