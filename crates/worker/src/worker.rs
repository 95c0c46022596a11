//! The consumer worker: one consumer identity, a concurrency gate, and
//! three long-lived loops (consumption, reclamation, ack flushing).
//!
//! Loop-level errors never terminate a loop; they are logged and retried
//! with a fixed backoff. Per-entry work is spawned into a supervised task
//! set so shutdown can wait (bounded) for in-flight jobs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use roadwatch_core::RetryLimits;
use roadwatch_observability::metrics::{self, CounterRegistry, CountersSnapshot};
use roadwatch_pipeline::{ArtifactStore, JobProcessor, ResourceGuard};

use crate::ack::AckBatcher;
use crate::config::WorkerConfig;
use crate::dispatch::{handle_entry, EntryContext};
use crate::log::{DeliveredEntry, StreamLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopped,
    Running,
    Stopping,
}

/// Snapshot for the ops surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub running: bool,
    pub consumer_identity: String,
    pub current_concurrency: u64,
    pub max_concurrency: usize,
}

/// The orchestrator. Construct once at process startup and share by `Arc`.
pub struct StreamWorker {
    log: Arc<dyn StreamLog>,
    counters: Arc<CounterRegistry>,
    config: WorkerConfig,
    partitions: Vec<String>,
    consumer: String,
    acks: Arc<AckBatcher>,
    ctx: EntryContext,
    state: Mutex<State>,
    shutdown: watch::Sender<bool>,
    // The gate is swapped wholesale on a concurrency update; tasks already
    // holding a permit from the old gate are unaffected.
    gate: RwLock<Arc<Semaphore>>,
    max_concurrency: AtomicUsize,
    tracker: TaskTracker,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamWorker {
    pub fn new(
        log: Arc<dyn StreamLog>,
        processor: Arc<dyn JobProcessor>,
        store: Arc<dyn ArtifactStore>,
        guard: Arc<dyn ResourceGuard>,
        counters: Arc<CounterRegistry>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let consumer = format!("worker_{}", Uuid::now_v7().simple());
        let partitions = config.partitions.resolve();
        let acks = Arc::new(AckBatcher::new(
            log.clone(),
            config.group.clone(),
            config.batch_ack,
        ));
        let (shutdown, _) = watch::channel(false);
        let max_concurrency = config.max_concurrency.max(1);

        let ctx = EntryContext {
            log: log.clone(),
            acks: acks.clone(),
            processor,
            store,
            guard,
            counters: counters.clone(),
            limits: RetryLimits {
                max_retry: config.max_retry,
                source_retry_limit: config.source_retry_limit,
            },
            guard_enabled: config.memory_guard,
            source_retry_delay: config.source_retry_delay,
            dlq_partition: config.dlq_partition(),
            upload_prefix: config.upload_prefix.clone(),
        };

        info!(
            consumer = %consumer,
            partitions = ?partitions,
            group = %config.group,
            max_concurrency,
            "stream worker initialized"
        );

        Arc::new(Self {
            log,
            counters,
            partitions,
            consumer,
            acks,
            ctx,
            state: Mutex::new(State::Stopped),
            shutdown,
            gate: RwLock::new(Arc::new(Semaphore::new(max_concurrency))),
            max_concurrency: AtomicUsize::new(max_concurrency),
            tracker: TaskTracker::new(),
            loops: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Start the three loops. A no-op (with a warning) when already running.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Stopped {
                warn!(consumer = %self.consumer, "worker already running, start ignored");
                return;
            }
            *state = State::Running;
        }
        // send_replace: the flag must flip even while no loop is subscribed
        // yet (first start, or a restart after stop).
        self.shutdown.send_replace(false);

        // Groups are created up front so a worker can start before any
        // producer; failures are retried by the loop's self-healing path.
        for partition in &self.partitions {
            if let Err(e) = self.log.ensure_group(partition, &self.config.group).await {
                warn!(partition = %partition, error = %e, "initial group creation failed");
            }
        }

        info!(consumer = %self.consumer, "stream worker started");

        let handles = vec![
            tokio::spawn(consume_loop(self.clone())),
            tokio::spawn(reclaim_loop(self.clone())),
            tokio::spawn(flush_loop(self.clone())),
        ];
        *self.loops.lock().unwrap() = handles;
    }

    /// Stop the loops, wait (bounded) for in-flight entries, and flush the
    /// remaining acknowledgments. Entries still unfinished after the grace
    /// period are abandoned to visibility-timeout reclamation.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Running {
                warn!(consumer = %self.consumer, "worker not running, stop ignored");
                return;
            }
            *state = State::Stopping;
        }
        info!(consumer = %self.consumer, "stream worker stopping");
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.loops.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "shutdown grace elapsed with entries still in flight"
            );
        }
        self.tracker.reopen();

        self.acks.flush().await;

        *self.state.lock().unwrap() = State::Stopped;
        info!(consumer = %self.consumer, "stream worker stopped");
    }

    /// Resize the concurrency gate. Values below 1 are clamped; the new
    /// gate applies to subsequently-dispatched entries only.
    pub fn update_concurrency(&self, requested: usize) {
        if requested < 1 {
            warn!(requested, "concurrency below 1 rejected, clamping to 1");
        }
        let new = requested.max(1);
        let old = self.max_concurrency.swap(new, Ordering::SeqCst);
        *self.gate.write().unwrap() = Arc::new(Semaphore::new(new));
        info!(old, new, "max concurrency updated");
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            running: *self.state.lock().unwrap() == State::Running,
            consumer_identity: self.consumer.clone(),
            current_concurrency: self.counters.get(metrics::IN_FLIGHT),
            max_concurrency: self.max_concurrency.load(Ordering::SeqCst),
        }
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    pub fn consumer_identity(&self) -> &str {
        &self.consumer
    }

    /// Spawn one supervised per-entry task. The consumption loop never
    /// waits on the gate itself; admission happens inside the task.
    fn dispatch(self: &Arc<Self>, delivered: DeliveredEntry) {
        let worker = self.clone();
        let gate = self.gate.read().unwrap().clone();
        self.tracker.spawn(async move {
            let Ok(_permit) = gate.acquire_owned().await else {
                // Gate was swapped out and closed; the entry stays pending
                // and comes back via reclamation.
                return;
            };
            let _in_flight = InFlightGuard::new(worker.counters.clone());
            handle_entry(&worker.ctx, delivered).await;
        });
    }

    /// Best-effort refresh of the `pending` gauge.
    async fn refresh_pending_gauge(&self) {
        let mut total = 0u64;
        for partition in &self.partitions {
            match self.log.pending_count(partition, &self.config.group).await {
                Ok(count) => total += count,
                Err(e) => {
                    debug!(partition = %partition, error = %e, "pending count unavailable");
                    return;
                }
            }
        }
        self.counters.set(metrics::PENDING, total);
    }
}

/// Holds the `in_flight` gauge up for exactly as long as an entry is inside
/// the gate, whatever exit path the task takes.
struct InFlightGuard(Arc<CounterRegistry>);

impl InFlightGuard {
    fn new(counters: Arc<CounterRegistry>) -> Self {
        counters.incr(metrics::IN_FLIGHT);
        Self(counters)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.decr(metrics::IN_FLIGHT);
    }
}

async fn consume_loop(worker: Arc<StreamWorker>) {
    let mut shutdown = worker.shutdown.subscribe();
    debug!("consumption loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let batch = worker
            .log
            .read_batch(
                &worker.partitions,
                &worker.config.group,
                &worker.consumer,
                worker.config.batch_count,
                worker.config.block,
            )
            .await;

        match batch {
            Ok(batch) => {
                if batch.is_empty() {
                    continue;
                }
                debug!(count = batch.len(), "batch received");
                for delivered in batch {
                    worker.dispatch(delivered);
                }
                worker.refresh_pending_gauge().await;
            }
            Err(e) if e.is_group_missing() => {
                // The group can be deleted or trimmed away externally;
                // recreate and keep consuming.
                warn!(error = %e, "consumer group missing, recreating");
                for partition in &worker.partitions {
                    if let Err(err) = worker
                        .log
                        .ensure_group(partition, &worker.config.group)
                        .await
                    {
                        warn!(partition = %partition, error = %err, "group recreation failed");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "read failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(worker.config.error_backoff) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    debug!("consumption loop stopped");
}

async fn reclaim_loop(worker: Arc<StreamWorker>) {
    let mut shutdown = worker.shutdown.subscribe();
    debug!("reclamation loop started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(worker.config.reclaim_interval) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        for partition in &worker.partitions {
            let reclaimed = worker
                .log
                .reclaim_stale(
                    partition,
                    &worker.config.group,
                    &worker.consumer,
                    worker.config.visibility_timeout,
                    worker.config.reclaim_batch_limit,
                )
                .await;

            match reclaimed {
                Ok(entries) if !entries.is_empty() => {
                    // Ownership moved to this consumer; the entries are not
                    // reprocessed here, the next read picks them up.
                    info!(
                        partition = %partition,
                        count = entries.len(),
                        "reclaimed stale entries"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(partition = %partition, error = %e, "reclaim failed");
                }
            }
        }
    }

    debug!("reclamation loop stopped");
}

async fn flush_loop(worker: Arc<StreamWorker>) {
    let mut shutdown = worker.shutdown.subscribe();
    debug!("ack flush loop started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(worker.config.ack_flush_interval()) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            // stop() runs the final flush after the loops exit.
            break;
        }
        worker.acks.flush().await;
    }

    debug!("ack flush loop stopped");
}
