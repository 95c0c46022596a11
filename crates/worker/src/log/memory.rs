//! In-memory log for tests and development.
//!
//! Models the consumer-group semantics the worker relies on: per-partition
//! append order, a shared group cursor created at the tail, pending-entry
//! ownership with idle clocks, and idempotent acknowledgment. Failure
//! injection hooks let tests exercise the worker's error paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{DeliveredEntry, StreamLog, StreamLogError};

#[derive(Debug, Clone)]
struct PendingInfo {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next entry this group has not yet delivered.
    cursor: usize,
    pending: HashMap<String, PendingInfo>,
}

#[derive(Debug, Default)]
struct PartitionState {
    seq: u64,
    entries: Vec<(String, Vec<(String, String)>)>,
    groups: HashMap<String, GroupState>,
}

/// In-memory [`StreamLog`].
#[derive(Default)]
pub struct InMemoryStreamLog {
    partitions: Mutex<HashMap<String, PartitionState>>,
    appended: Notify,
    ack_calls: Mutex<u64>,
    read_failures: Mutex<u32>,
    ack_failures: Mutex<u32>,
}

impl InMemoryStreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries ever appended to a partition, in order.
    pub fn entries(&self, partition: &str) -> Vec<(String, Vec<(String, String)>)> {
        let partitions = self.partitions.lock().unwrap();
        partitions
            .get(partition)
            .map(|p| p.entries.clone())
            .unwrap_or_default()
    }

    pub fn entry_count(&self, partition: &str) -> usize {
        self.entries(partition).len()
    }

    /// `(entry_id, owning consumer)` for every pending entry of a group.
    pub fn pending_entries(&self, partition: &str, group: &str) -> Vec<(String, String)> {
        let partitions = self.partitions.lock().unwrap();
        let Some(state) = partitions.get(partition).and_then(|p| p.groups.get(group)) else {
            return Vec::new();
        };
        let mut pending: Vec<_> = state
            .pending
            .iter()
            .map(|(id, info)| (id.clone(), info.consumer.clone()))
            .collect();
        pending.sort();
        pending
    }

    /// How many underlying acknowledge calls were issued (each call may
    /// cover many ids).
    pub fn ack_call_count(&self) -> u64 {
        *self.ack_calls.lock().unwrap()
    }

    /// Drop a consumer group, as external trimming or deletion would.
    /// Subsequent reads surface `GroupMissing` until it is recreated.
    pub fn remove_group(&self, partition: &str, group: &str) {
        let mut partitions = self.partitions.lock().unwrap();
        if let Some(part) = partitions.get_mut(partition) {
            part.groups.remove(group);
        }
    }

    /// Make the next `n` reads fail with a backend error.
    pub fn inject_read_failures(&self, n: u32) {
        *self.read_failures.lock().unwrap() = n;
    }

    /// Make the next `n` acknowledge calls fail with a backend error.
    pub fn inject_ack_failures(&self, n: u32) {
        *self.ack_failures.lock().unwrap() = n;
    }

    fn take_injected(&self, slot: &Mutex<u32>) -> bool {
        let mut remaining = slot.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl StreamLog for InMemoryStreamLog {
    async fn ensure_group(&self, partition: &str, group: &str) -> Result<(), StreamLogError> {
        let mut partitions = self.partitions.lock().unwrap();
        let state = partitions.entry(partition.to_string()).or_default();
        let tail = state.entries.len();
        state.groups.entry(group.to_string()).or_insert(GroupState {
            cursor: tail,
            pending: HashMap::new(),
        });
        Ok(())
    }

    async fn read_batch(
        &self,
        partitions: &[String],
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<DeliveredEntry>, StreamLogError> {
        let deadline = Instant::now() + block;

        loop {
            {
                let mut state = self.partitions.lock().unwrap();

                if self.take_injected(&self.read_failures) {
                    return Err(StreamLogError::Backend("injected read failure".into()));
                }

                // A group can vanish underneath the worker; surface that for
                // every partition before consuming any cursor.
                for partition in partitions {
                    let exists = state
                        .get(partition)
                        .is_some_and(|p| p.groups.contains_key(group));
                    if !exists {
                        return Err(StreamLogError::GroupMissing(partition.clone()));
                    }
                }

                let mut delivered = Vec::new();
                for partition in partitions {
                    let part = state.get_mut(partition).unwrap();
                    let group_state = part.groups.get_mut(group).unwrap();

                    let from = group_state.cursor;
                    let to = (from + max_count).min(part.entries.len());
                    for (entry_id, fields) in &part.entries[from..to] {
                        group_state.pending.insert(
                            entry_id.clone(),
                            PendingInfo {
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                                delivery_count: 1,
                            },
                        );
                        delivered.push(DeliveredEntry {
                            partition: partition.clone(),
                            entry_id: entry_id.clone(),
                            fields: fields.clone(),
                        });
                    }
                    group_state.cursor = to;
                }

                if !delivered.is_empty() {
                    return Ok(delivered);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let nap = (deadline - now).min(Duration::from_millis(10));
            tokio::select! {
                _ = self.appended.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn append(
        &self,
        partition: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamLogError> {
        let entry_id = {
            let mut partitions = self.partitions.lock().unwrap();
            let state = partitions.entry(partition.to_string()).or_default();
            state.seq += 1;
            let entry_id = format!("{}-0", state.seq);
            state.entries.push((entry_id.clone(), fields.to_vec()));
            entry_id
        };
        self.appended.notify_waiters();
        Ok(entry_id)
    }

    async fn acknowledge(
        &self,
        partition: &str,
        group: &str,
        entry_ids: &[String],
    ) -> Result<(), StreamLogError> {
        if entry_ids.is_empty() {
            return Ok(());
        }

        *self.ack_calls.lock().unwrap() += 1;
        if self.take_injected(&self.ack_failures) {
            return Err(StreamLogError::Backend("injected ack failure".into()));
        }

        let mut partitions = self.partitions.lock().unwrap();
        if let Some(group_state) = partitions
            .get_mut(partition)
            .and_then(|p| p.groups.get_mut(group))
        {
            for entry_id in entry_ids {
                // Unknown or already-acknowledged ids are simply not pending.
                group_state.pending.remove(entry_id);
            }
        }
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        partition: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<DeliveredEntry>, StreamLogError> {
        let mut partitions = self.partitions.lock().unwrap();
        let Some(part) = partitions.get_mut(partition) else {
            return Err(StreamLogError::GroupMissing(partition.to_string()));
        };
        let fields_by_id: HashMap<String, Vec<(String, String)>> =
            part.entries.iter().cloned().collect();
        let Some(group_state) = part.groups.get_mut(group) else {
            return Err(StreamLogError::GroupMissing(partition.to_string()));
        };

        let now = Instant::now();
        let mut stale: Vec<String> = group_state
            .pending
            .iter()
            .filter(|(_, info)| now.duration_since(info.delivered_at) >= min_idle)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        stale.truncate(max_count);

        let mut reclaimed = Vec::new();
        for entry_id in stale {
            let info = group_state.pending.get_mut(&entry_id).unwrap();
            info.consumer = consumer.to_string();
            info.delivered_at = now;
            info.delivery_count += 1;
            reclaimed.push(DeliveredEntry {
                partition: partition.to_string(),
                entry_id: entry_id.clone(),
                fields: fields_by_id.get(&entry_id).cloned().unwrap_or_default(),
            });
        }
        Ok(reclaimed)
    }

    async fn pending_count(&self, partition: &str, group: &str) -> Result<u64, StreamLogError> {
        let partitions = self.partitions.lock().unwrap();
        let Some(group_state) = partitions.get(partition).and_then(|p| p.groups.get(group)) else {
            return Err(StreamLogError::GroupMissing(partition.to_string()));
        };
        Ok(group_state.pending.len() as u64)
    }
}
