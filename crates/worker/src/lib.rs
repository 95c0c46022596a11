//! `roadwatch-worker` — the stream-consumption and delivery-reliability
//! engine.
//!
//! A worker owns a consumer identity in a shared consumer group, reads job
//! entries off one or more Redis-Streams partitions, pushes each through the
//! analysis pipeline under a concurrency gate, and guarantees every entry is
//! acknowledged, requeued with bounded attempts, or dead-lettered. Crashed
//! consumers' entries come back via visibility-timeout reclamation.

pub mod ack;
pub mod config;
pub mod dispatch;
pub mod log;
pub mod worker;

pub use ack::AckBatcher;
pub use config::{PartitionSpec, WorkerConfig};
pub use log::{DeliveredEntry, InMemoryStreamLog, RedisStreamLog, StreamLog, StreamLogError};
pub use worker::{StreamWorker, WorkerStatus};
