//! In-process counters (processed/failed/retried/dlq plus live gauges).
//!
//! Deliberately minimal: a fixed name set, one lock, no export pipeline.
//! Long-term metrics storage is somebody else's problem; these exist so the
//! ops surface can answer "what has this worker done since it started".

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Monotonic tally of completed entries.
pub const PROCESSED: &str = "processed";
/// Monotonic tally of failed attempts.
pub const FAILED: &str = "failed";
/// Monotonic tally of entries requeued (failures and deferrals alike).
pub const RETRIED: &str = "retried";
/// Monotonic tally of dead-lettered entries.
pub const DLQ: &str = "dlq";
/// Live gauge: delivered-but-unacknowledged entries (refreshed from the log).
pub const PENDING: &str = "pending";
/// Live gauge: entries currently inside the processing gate.
pub const IN_FLIGHT: &str = "in_flight";

const COUNTER_NAMES: [&str; 6] = [PROCESSED, FAILED, RETRIED, DLQ, PENDING, IN_FLIGHT];

/// Point-in-time view of all counters.
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub uptime_seconds: i64,
    pub start_time: DateTime<Utc>,
}

struct Inner {
    counters: BTreeMap<&'static str, u64>,
    start_time: DateTime<Utc>,
}

/// Process-wide named counters.
///
/// All mutation goes through the internal lock; values are never inspected
/// and then written back by callers. Unknown counter names are ignored, the
/// set is fixed at construction.
pub struct CounterRegistry {
    inner: Mutex<Inner>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                counters: COUNTER_NAMES.iter().map(|n| (*n, 0)).collect(),
                start_time: Utc::now(),
            }),
        }
    }

    /// Add `1` to a counter.
    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    /// Add `delta` to a counter.
    pub fn incr_by(&self, name: &str, delta: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(value) = inner.counters.get_mut(name) {
            *value += delta;
        }
    }

    /// Subtract `1`, flooring at zero.
    pub fn decr(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(value) = inner.counters.get_mut(name) {
            *value = value.saturating_sub(1);
        }
    }

    /// Overwrite a counter (used for the live gauges).
    pub fn set(&self, name: &str, value: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.counters.get_mut(name) {
            *slot = value;
        }
    }

    /// Read a single counter (0 for unknown names).
    pub fn get(&self, name: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.counters.get(name).copied().unwrap_or(0)
    }

    /// Snapshot every counter plus uptime.
    pub fn snapshot(&self) -> CountersSnapshot {
        let inner = self.inner.lock().unwrap();
        CountersSnapshot {
            counters: inner
                .counters
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            uptime_seconds: (Utc::now() - inner.start_time).num_seconds(),
            start_time: inner.start_time,
        }
    }

    /// Reset tallies and restart the uptime clock. The `in_flight` gauge
    /// tracks live tasks and survives the reset.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        let in_flight = inner.counters.get(IN_FLIGHT).copied().unwrap_or(0);
        for value in inner.counters.values_mut() {
            *value = 0;
        }
        inner.counters.insert(IN_FLIGHT, in_flight);
        inner.start_time = Utc::now();
    }
}

impl Default for CounterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_and_decrements() {
        let registry = CounterRegistry::new();

        registry.incr(PROCESSED);
        registry.incr(PROCESSED);
        registry.incr(IN_FLIGHT);
        registry.decr(IN_FLIGHT);
        registry.decr(IN_FLIGHT); // floors at zero

        assert_eq!(registry.get(PROCESSED), 2);
        assert_eq!(registry.get(IN_FLIGHT), 0);
    }

    #[test]
    fn unknown_names_are_ignored() {
        let registry = CounterRegistry::new();
        registry.incr("no_such_counter");
        assert_eq!(registry.get("no_such_counter"), 0);
        assert!(!registry.snapshot().counters.contains_key("no_such_counter"));
    }

    #[test]
    fn set_overwrites_gauges() {
        let registry = CounterRegistry::new();
        registry.set(PENDING, 42);
        assert_eq!(registry.get(PENDING), 42);
    }

    #[test]
    fn reset_keeps_in_flight() {
        let registry = CounterRegistry::new();
        registry.incr(PROCESSED);
        registry.incr(IN_FLIGHT);
        registry.incr(IN_FLIGHT);

        registry.reset();

        assert_eq!(registry.get(PROCESSED), 0);
        assert_eq!(registry.get(IN_FLIGHT), 2);
    }

    #[test]
    fn snapshot_serializes() {
        let registry = CounterRegistry::new();
        registry.incr(DLQ);

        let snap = registry.snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["counters"]["dlq"], 1);
        assert!(json["uptime_seconds"].is_i64());
    }
}
