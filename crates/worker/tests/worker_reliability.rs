//! End-to-end delivery-reliability scenarios against the in-memory log.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use roadwatch_core::{ProcessReport, ProcessStatus};
use roadwatch_observability::metrics::{self, CounterRegistry};
use roadwatch_pipeline::{
    DisabledGuard, JobProcessor, NullArtifactStore, ProcessError, ProcessRequest, ResourceGuard,
};
use roadwatch_worker::{InMemoryStreamLog, PartitionSpec, StreamLog, StreamWorker, WorkerConfig};

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_partitions(PartitionSpec::Single("jobs".to_string()))
        .with_group("workers")
        .with_block(Duration::from_millis(20))
        .with_ack_flush_interval(Duration::from_millis(50))
        .with_source_retry(3, Duration::ZERO)
        .with_memory_guard(false)
        .with_shutdown_grace(Duration::from_secs(2))
}

async fn wait_until(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn job_fields(url: &str, attempt: u32) -> Vec<(String, String)> {
    vec![
        ("cctvId".to_string(), "cam-1".to_string()),
        ("hls".to_string(), url.to_string()),
        ("attempt".to_string(), attempt.to_string()),
    ]
}

fn attempt_of(fields: &[(String, String)]) -> u32 {
    fields
        .iter()
        .find(|(k, _)| k == "attempt")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0)
}

struct AlwaysFailing;

#[async_trait]
impl JobProcessor for AlwaysFailing {
    async fn process(&self, _req: &ProcessRequest) -> Result<ProcessReport, ProcessError> {
        Err(ProcessError::Pipeline("inference crashed".into()))
    }
}

struct AlwaysSucceeding;

#[async_trait]
impl JobProcessor for AlwaysSucceeding {
    async fn process(&self, _req: &ProcessRequest) -> Result<ProcessReport, ProcessError> {
        Ok(ProcessReport::new(ProcessStatus::Success))
    }
}

/// Blocks inside `process` until released; records peak concurrency.
struct BlockingProcessor {
    active: AtomicUsize,
    peak: AtomicUsize,
    release: tokio::sync::Semaphore,
    completed: AtomicUsize,
}

impl BlockingProcessor {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            release: tokio::sync::Semaphore::new(0),
            completed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobProcessor for BlockingProcessor {
    async fn process(&self, _req: &ProcessRequest) -> Result<ProcessReport, ProcessError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let permit = self.release.acquire().await.expect("release closed");
        permit.forget();

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessReport::new(ProcessStatus::Success))
    }
}

/// Refuses the first `n` admission checks, then always admits.
struct CountdownGuard {
    refusals: AtomicU32,
}

#[async_trait]
impl ResourceGuard for CountdownGuard {
    async fn has_headroom(&self) -> bool {
        let remaining = self.refusals.load(Ordering::SeqCst);
        if remaining > 0 {
            self.refusals.fetch_sub(1, Ordering::SeqCst);
            false
        } else {
            true
        }
    }
}

struct Harness {
    worker: Arc<StreamWorker>,
    log: Arc<InMemoryStreamLog>,
    counters: Arc<CounterRegistry>,
}

fn harness(
    config: WorkerConfig,
    processor: Arc<dyn JobProcessor>,
    guard: Arc<dyn ResourceGuard>,
) -> Harness {
    let log = Arc::new(InMemoryStreamLog::new());
    let counters = Arc::new(CounterRegistry::new());
    let worker = StreamWorker::new(
        log.clone(),
        processor,
        Arc::new(NullArtifactStore),
        guard,
        counters.clone(),
        config,
    );
    Harness {
        worker,
        log,
        counters,
    }
}

#[tokio::test]
async fn always_failing_job_is_requeued_three_times_then_dead_lettered() {
    let h = harness(
        fast_config().with_max_retry(3),
        Arc::new(AlwaysFailing),
        Arc::new(DisabledGuard),
    );

    h.worker.start().await;
    h.log
        .append("jobs", &job_fields("http://x/a.m3u8", 0))
        .await
        .unwrap();

    let counters = h.counters.clone();
    wait_until("dead-letter entry", Duration::from_secs(5), || {
        counters.get(metrics::DLQ) == 1
    })
    .await;
    h.worker.stop().await;

    // Four generations lived on the partition: attempts 0 through 3.
    let entries = h.log.entries("jobs");
    assert_eq!(entries.len(), 4);
    let attempts: Vec<u32> = entries.iter().map(|(_, f)| attempt_of(f)).collect();
    assert_eq!(attempts, vec![0, 1, 2, 3]);

    // Exactly one dead-letter entry, final error intact.
    let dlq = h.log.entries("jobs:dlq");
    assert_eq!(dlq.len(), 1);
    let final_error = dlq[0]
        .1
        .iter()
        .find(|(k, _)| k == "final_error")
        .map(|(_, v)| v.clone())
        .unwrap();
    assert!(!final_error.is_empty());
    assert_eq!(attempt_of(&dlq[0].1), 3);

    assert_eq!(h.counters.get(metrics::RETRIED), 3);
    assert_eq!(h.counters.get(metrics::FAILED), 4);
    assert_eq!(h.counters.get(metrics::PROCESSED), 0);

    // The dead-lettered generation was acknowledged; the earlier ones stay
    // pending until the visibility timeout would reclaim them.
    let pending = h.log.pending_entries("jobs", "workers");
    assert_eq!(pending.len(), 3);
}

#[tokio::test]
async fn at_least_once_every_entry_processes_or_dead_letters() {
    let h = harness(
        fast_config(),
        Arc::new(AlwaysSucceeding),
        Arc::new(DisabledGuard),
    );

    h.worker.start().await;
    for i in 0..10 {
        h.log
            .append("jobs", &job_fields(&format!("http://x/{i}.m3u8"), 0))
            .await
            .unwrap();
    }

    let counters = h.counters.clone();
    wait_until("all entries processed", Duration::from_secs(5), || {
        counters.get(metrics::PROCESSED) == 10
    })
    .await;
    h.worker.stop().await;

    assert_eq!(h.counters.get(metrics::DLQ), 0);
    // Final flush on stop: nothing left pending.
    assert_eq!(h.log.pending_count("jobs", "workers").await.unwrap(), 0);
}

#[tokio::test]
async fn concurrency_gate_bounds_entries_inside_the_adapter() {
    let processor = Arc::new(BlockingProcessor::new());
    let h = harness(
        fast_config().with_max_concurrency(2),
        processor.clone(),
        Arc::new(DisabledGuard),
    );

    h.worker.start().await;
    for i in 0..3 {
        h.log
            .append("jobs", &job_fields(&format!("http://x/{i}.m3u8"), 0))
            .await
            .unwrap();
    }

    // Two admitted, the third parked on the gate.
    let p = processor.clone();
    wait_until("two jobs inside the adapter", Duration::from_secs(5), || {
        p.active.load(Ordering::SeqCst) == 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processor.active.load(Ordering::SeqCst), 2);
    assert_eq!(processor.peak.load(Ordering::SeqCst), 2);

    // Releasing one admits exactly one more.
    processor.release.add_permits(1);
    let p = processor.clone();
    wait_until("third job admitted", Duration::from_secs(5), || {
        p.completed.load(Ordering::SeqCst) == 1 && p.active.load(Ordering::SeqCst) == 2
    })
    .await;
    assert!(processor.peak.load(Ordering::SeqCst) <= 2);

    processor.release.add_permits(2);
    let counters = h.counters.clone();
    wait_until("all three processed", Duration::from_secs(5), || {
        counters.get(metrics::PROCESSED) == 3
    })
    .await;

    h.worker.stop().await;
}

#[tokio::test]
async fn congestion_defers_without_burning_attempt_budget() {
    let h = harness(
        fast_config().with_memory_guard(true).with_max_retry(2),
        Arc::new(AlwaysSucceeding),
        Arc::new(CountdownGuard {
            refusals: AtomicU32::new(3),
        }),
    );

    h.worker.start().await;
    h.log
        .append("jobs", &job_fields("http://x/a.m3u8", 0))
        .await
        .unwrap();

    let counters = h.counters.clone();
    wait_until("entry finally processed", Duration::from_secs(5), || {
        counters.get(metrics::PROCESSED) == 1
    })
    .await;
    h.worker.stop().await;

    // Three deferrals, each a fresh copy with the attempt untouched; the
    // guard never dead-letters a healthy job even past max_retry.
    let entries = h.log.entries("jobs");
    assert_eq!(entries.len(), 4);
    for (_, fields) in &entries {
        assert_eq!(attempt_of(fields), 0);
    }
    assert_eq!(h.counters.get(metrics::DLQ), 0);
    assert_eq!(h.counters.get(metrics::FAILED), 0);
    assert_eq!(h.counters.get(metrics::RETRIED), 3);
}

#[tokio::test]
async fn group_deleted_under_a_running_worker_self_heals() {
    let h = harness(
        fast_config(),
        Arc::new(AlwaysSucceeding),
        Arc::new(DisabledGuard),
    );

    h.worker.start().await;
    h.log
        .append("jobs", &job_fields("http://x/a.m3u8", 0))
        .await
        .unwrap();
    let counters = h.counters.clone();
    wait_until("first entry processed", Duration::from_secs(5), || {
        counters.get(metrics::PROCESSED) == 1
    })
    .await;

    // Simulate external trimming: the group vanishes mid-run.
    h.log.remove_group("jobs", "workers");
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.log
        .append("jobs", &job_fields("http://x/b.m3u8", 0))
        .await
        .unwrap();
    let counters = h.counters.clone();
    wait_until("entry after recreation processed", Duration::from_secs(5), || {
        counters.get(metrics::PROCESSED) == 2
    })
    .await;

    h.worker.stop().await;
}

#[tokio::test]
async fn reclaim_loop_takes_over_another_consumers_stale_entries() {
    let h = harness(
        fast_config()
            .with_visibility_timeout(Duration::from_millis(50))
            .with_reclaim_interval(Duration::from_millis(100)),
        Arc::new(AlwaysSucceeding),
        Arc::new(DisabledGuard),
    );

    // A foreign consumer takes delivery and then disappears.
    h.log.ensure_group("jobs", "workers").await.unwrap();
    h.log
        .append("jobs", &job_fields("http://x/a.m3u8", 0))
        .await
        .unwrap();
    h.log
        .read_batch(
            &["jobs".to_string()],
            "workers",
            "crashed_consumer",
            10,
            Duration::from_millis(10),
        )
        .await
        .unwrap();

    h.worker.start().await;

    let log = h.log.clone();
    let identity = h.worker.consumer_identity().to_string();
    wait_until("ownership transferred", Duration::from_secs(5), move || {
        log.pending_entries("jobs", "workers")
            .iter()
            .any(|(_, consumer)| consumer == &identity)
    })
    .await;

    h.worker.stop().await;
}

#[tokio::test]
async fn stop_flushes_buffered_acknowledgments() {
    // Flush interval far beyond the test horizon: only the final flush can
    // clear the buffer.
    let h = harness(
        fast_config().with_ack_flush_interval(Duration::from_secs(600)),
        Arc::new(AlwaysSucceeding),
        Arc::new(DisabledGuard),
    );

    h.worker.start().await;
    h.log
        .append("jobs", &job_fields("http://x/a.m3u8", 0))
        .await
        .unwrap();

    let counters = h.counters.clone();
    wait_until("entry processed", Duration::from_secs(5), || {
        counters.get(metrics::PROCESSED) == 1
    })
    .await;
    assert_eq!(h.log.pending_count("jobs", "workers").await.unwrap(), 1);

    h.worker.stop().await;
    assert_eq!(h.log.pending_count("jobs", "workers").await.unwrap(), 0);
}
