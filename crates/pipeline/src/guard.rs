//! Admission guard consulted before each pipeline invocation.
//!
//! A refusal is congestion, not failure: the entry is requeued without
//! consuming attempt budget. Guard probes must never take the worker down,
//! so probe errors report headroom.

use async_trait::async_trait;
use sysinfo::System;
use tracing::warn;

/// Default free-memory floor: below this the guard refuses admission.
pub const DEFAULT_MIN_FREE_BYTES: u64 = 1024 * 1024 * 1024;

/// Resource headroom check.
#[async_trait]
pub trait ResourceGuard: Send + Sync {
    /// Whether there is enough headroom to admit one more job.
    async fn has_headroom(&self) -> bool;
}

/// Guard used when admission control is switched off.
#[derive(Debug, Default)]
pub struct DisabledGuard;

#[async_trait]
impl ResourceGuard for DisabledGuard {
    async fn has_headroom(&self) -> bool {
        true
    }
}

/// Refuses admission when available system memory drops below a floor.
#[derive(Debug)]
pub struct SystemMemoryGuard {
    min_free_bytes: u64,
}

impl SystemMemoryGuard {
    pub fn new(min_free_bytes: u64) -> Self {
        Self { min_free_bytes }
    }
}

impl Default for SystemMemoryGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_FREE_BYTES)
    }
}

#[async_trait]
impl ResourceGuard for SystemMemoryGuard {
    async fn has_headroom(&self) -> bool {
        let mut system = System::new();
        system.refresh_memory();
        let available = system.available_memory();

        if available < self.min_free_bytes {
            warn!(
                available_mb = available / (1024 * 1024),
                floor_mb = self.min_free_bytes / (1024 * 1024),
                "memory headroom below floor, deferring job"
            );
            return false;
        }
        true
    }
}
