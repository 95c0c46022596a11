//! Batched acknowledgment.
//!
//! Completion is on the hot path; one acknowledge round-trip per entry is
//! not. The batcher buffers acknowledged entry ids per partition and a
//! periodic flush sends them in one call each. With batching disabled it
//! degenerates to immediate acknowledgment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::log::StreamLog;

/// Buffers entry ids per partition until the next flush.
pub struct AckBatcher {
    log: Arc<dyn StreamLog>,
    group: String,
    enabled: bool,
    // One lock covers every buffer; flush swaps lists out under it and does
    // the I/O after releasing it.
    buffers: Mutex<HashMap<String, Vec<String>>>,
}

impl AckBatcher {
    pub fn new(log: Arc<dyn StreamLog>, group: impl Into<String>, enabled: bool) -> Self {
        Self {
            log,
            group: group.into(),
            enabled,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Record an entry as handled. Buffered when batching is enabled,
    /// acknowledged immediately otherwise. Acknowledge failures are logged
    /// and accepted: the entry stays pending and reclamation will recover
    /// it, which at worst means a redelivery.
    pub async fn schedule_ack(&self, partition: &str, entry_id: &str) {
        if !self.enabled {
            if let Err(e) = self
                .log
                .acknowledge(partition, &self.group, &[entry_id.to_string()])
                .await
            {
                warn!(partition, entry_id, error = %e, "immediate ack failed");
            }
            return;
        }

        let mut buffers = self.buffers.lock().unwrap();
        buffers
            .entry(partition.to_string())
            .or_default()
            .push(entry_id.to_string());
    }

    /// Acknowledge everything buffered so far, one call per partition.
    /// Failed batches are dropped, not re-buffered; those ids remain pending
    /// on the log until reclaimed.
    pub async fn flush(&self) {
        let drained: Vec<(String, Vec<String>)> = {
            let mut buffers = self.buffers.lock().unwrap();
            buffers.drain().filter(|(_, ids)| !ids.is_empty()).collect()
        };

        for (partition, ids) in drained {
            match self.log.acknowledge(&partition, &self.group, &ids).await {
                Ok(()) => {
                    debug!(partition = %partition, count = ids.len(), "acks flushed");
                }
                Err(e) => {
                    warn!(
                        partition = %partition,
                        count = ids.len(),
                        error = %e,
                        "ack flush failed, entries stay pending until reclaimed"
                    );
                }
            }
        }
    }

    /// Ids currently buffered (all partitions).
    pub fn buffered(&self) -> usize {
        self.buffers.lock().unwrap().values().map(Vec::len).sum()
    }
}
