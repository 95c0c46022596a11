//! The log client: consumer-group operations over partitioned append-only
//! streams.
//!
//! This is a thin capability over the wire protocol; it adds no retry or
//! routing policy of its own. [`RedisStreamLog`] speaks Redis Streams,
//! [`InMemoryStreamLog`] models the same semantics for tests.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis;

pub use memory::InMemoryStreamLog;
pub use redis::RedisStreamLog;

/// One entry handed to a consumer by a batched read or a reclaim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredEntry {
    pub partition: String,
    pub entry_id: String,
    pub fields: Vec<(String, String)>,
}

/// Log client failure.
///
/// `GroupMissing` is deliberately distinguished: the consumer group can
/// vanish underneath a running worker (partition deleted or trimmed
/// externally) and the caller self-heals by recreating it instead of
/// backing off.
#[derive(Debug, Error)]
pub enum StreamLogError {
    /// The consumer group (or its partition) no longer exists.
    #[error("consumer group missing on {0}")]
    GroupMissing(String),

    /// Transport/protocol error, propagated undecorated.
    #[error(transparent)]
    Transport(#[from] ::redis::RedisError),

    /// Backend-specific failure (used by non-Redis implementations).
    #[error("log backend: {0}")]
    Backend(String),
}

impl StreamLogError {
    pub fn is_group_missing(&self) -> bool {
        matches!(self, StreamLogError::GroupMissing(_))
    }
}

/// Consumer-group operations the worker needs from the log.
///
/// Implementations must be safe for concurrent use; the consumption,
/// reclamation, and ack-flush loops all share one client.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Create `group` on `partition` at the tail, creating the partition
    /// itself if needed. Idempotent: an existing group is not an error.
    async fn ensure_group(&self, partition: &str, group: &str) -> Result<(), StreamLogError>;

    /// Blocking read of up to `max_count` new entries per partition, waiting
    /// up to `block` when none are available. Empty result on timeout.
    async fn read_batch(
        &self,
        partitions: &[String],
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<DeliveredEntry>, StreamLogError>;

    /// Append an entry; returns the assigned entry id.
    async fn append(
        &self,
        partition: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamLogError>;

    /// Mark entries as handled. Idempotent: already-acknowledged or unknown
    /// ids are not an error.
    async fn acknowledge(
        &self,
        partition: &str,
        group: &str,
        entry_ids: &[String],
    ) -> Result<(), StreamLogError>;

    /// Atomically transfer ownership of entries idle longer than `min_idle`
    /// to `consumer`, up to `max_count`, returning them.
    async fn reclaim_stale(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<DeliveredEntry>, StreamLogError>;

    /// Approximate count of delivered-but-unacknowledged entries.
    async fn pending_count(&self, partition: &str, group: &str) -> Result<u64, StreamLogError>;
}
