//! Per-entry processing: one delivered entry in, exactly one disposition
//! out.
//!
//! Nothing here may escape and take a loop down: every failure is folded
//! into an [`EntryOutcome`] and the retry/dead-letter policy is the pure
//! [`decide`] function over it. Acknowledgment, requeueing, and dead-letter
//! appends are the only side effects.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use roadwatch_core::{
    decide, Disposition, EntryOutcome, JobEntry, ProcessReport, ProcessStatus, RetryLimits,
};
use roadwatch_observability::metrics::{self, CounterRegistry};
use roadwatch_pipeline::processor::cleanup_scratch;
use roadwatch_pipeline::{ArtifactStore, JobProcessor, ProcessRequest, ResourceGuard};

use crate::ack::AckBatcher;
use crate::log::{DeliveredEntry, StreamLog};

/// Everything a dispatched task needs, shared across all tasks.
pub(crate) struct EntryContext {
    pub log: Arc<dyn StreamLog>,
    pub acks: Arc<AckBatcher>,
    pub processor: Arc<dyn JobProcessor>,
    pub store: Arc<dyn ArtifactStore>,
    pub guard: Arc<dyn ResourceGuard>,
    pub counters: Arc<CounterRegistry>,
    pub limits: RetryLimits,
    pub guard_enabled: bool,
    pub source_retry_delay: Duration,
    pub dlq_partition: String,
    pub upload_prefix: String,
}

/// Process one delivered entry through to its disposition.
pub(crate) async fn handle_entry(ctx: &EntryContext, delivered: DeliveredEntry) {
    let DeliveredEntry {
        partition,
        entry_id,
        fields,
    } = delivered;
    let pairs: Vec<(&str, &str)> = fields
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let strict = JobEntry::from_fields(pairs.iter().copied())
        .and_then(|entry| entry.validate().map(|()| entry));
    // The failure path still needs the entry's fields to derive a requeue or
    // dead-letter copy, so fall back to a lossy decode.
    let entry = match &strict {
        Ok(entry) => entry.clone(),
        Err(_) => JobEntry::from_fields_lossy(pairs.iter().copied()),
    };
    let job_id = entry.job_id_or(&entry_id).to_string();

    info!(
        partition = %partition,
        entry_id = %entry_id,
        job_id = %job_id,
        cctv_id = %entry.cctv_id,
        attempt = entry.attempt,
        "processing entry"
    );

    let mut report: Option<ProcessReport> = None;
    let outcome = match strict {
        Err(e) => EntryOutcome::Failed(e.to_string()),
        Ok(_) => {
            if ctx.guard_enabled && !ctx.guard.has_headroom().await {
                EntryOutcome::Congested
            } else {
                let request = ProcessRequest {
                    cctv_id: entry.cctv_id.clone(),
                    source_url: entry.source_url.clone(),
                    duration_seconds: entry.duration_seconds,
                    job_id: job_id.clone(),
                };
                match ctx.processor.process(&request).await {
                    Ok(r) => {
                        let status = r.status;
                        report = Some(r);
                        EntryOutcome::Processed(status)
                    }
                    Err(e) => EntryOutcome::Failed(e.to_string()),
                }
            }
        }
    };

    let disposition = decide(&outcome, entry.attempt, ctx.limits);

    match disposition {
        Disposition::Complete => {
            let exported = match &report {
                Some(report) => export_artifacts(ctx, &entry, &job_id, report).await,
                None => Ok(()),
            };
            match exported {
                Ok(()) => {
                    ctx.acks.schedule_ack(&partition, &entry_id).await;
                    ctx.counters.incr(metrics::PROCESSED);
                    info!(
                        job_id = %job_id,
                        status = ?outcome,
                        "entry completed"
                    );
                }
                Err(e) => {
                    // Export failures consume attempt budget like any other
                    // processing failure.
                    ctx.counters.incr(metrics::FAILED);
                    let fallback =
                        decide(&EntryOutcome::Failed(e.clone()), entry.attempt, ctx.limits);
                    match fallback {
                        Disposition::Requeue { error, counts_attempt } => {
                            requeue(ctx, &entry, &partition, &error, counts_attempt).await;
                        }
                        Disposition::DeadLetter { error } => {
                            dead_letter(ctx, &entry, &partition, &entry_id, &error).await;
                        }
                        Disposition::Complete => unreachable!("failure never completes"),
                    }
                }
            }
        }
        Disposition::Requeue {
            error,
            counts_attempt,
        } => {
            if matches!(outcome, EntryOutcome::Failed(_)) {
                ctx.counters.incr(metrics::FAILED);
            }
            if matches!(
                outcome,
                EntryOutcome::Processed(ProcessStatus::UpstreamUnreachable)
            ) {
                // Give a down source a moment before offering the job again.
                tokio::time::sleep(ctx.source_retry_delay).await;
            }
            requeue(ctx, &entry, &partition, &error, counts_attempt).await;
        }
        Disposition::DeadLetter { error } => {
            ctx.counters.incr(metrics::FAILED);
            dead_letter(ctx, &entry, &partition, &entry_id, &error).await;
        }
    }

    if let Some(scratch) = report.as_ref().and_then(|r| r.scratch_dir.as_deref()) {
        cleanup_scratch(scratch);
    }
}

/// Upload the report's artifacts under the job's object-key prefix.
async fn export_artifacts(
    ctx: &EntryContext,
    entry: &JobEntry,
    job_id: &str,
    report: &ProcessReport,
) -> Result<(), String> {
    if report.artifacts.is_empty() {
        return Ok(());
    }

    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let prefix = format!(
        "{}{}/{}/{}",
        ctx.upload_prefix, entry.cctv_id, job_id, timestamp
    );

    match ctx.store.upload(&report.artifacts, &prefix).await {
        Ok(keys) => {
            info!(job_id = %job_id, prefix = %prefix, uploaded = keys.len(), "artifacts exported");
            Ok(())
        }
        Err(e) => Err(format!("artifact export failed: {e}")),
    }
}

/// Append a derived copy of the entry back onto its partition. The original
/// stays pending; if this append fails the original is recovered by
/// reclamation, so the job is never lost either way.
async fn requeue(
    ctx: &EntryContext,
    entry: &JobEntry,
    partition: &str,
    error: &str,
    counts_attempt: bool,
) {
    let now = Utc::now().timestamp_millis();
    let next = if counts_attempt {
        entry.retry_entry(error, now)
    } else {
        entry.congested_entry(error, now)
    };

    match ctx.log.append(partition, &next.to_fields()).await {
        Ok(_) => {
            ctx.counters.incr(metrics::RETRIED);
            info!(
                partition = %partition,
                attempt = next.attempt,
                error = %error,
                "entry requeued"
            );
        }
        Err(e) => {
            error!(partition = %partition, error = %e, "requeue append failed");
        }
    }
}

/// Dead-letter, then acknowledge. The order matters: a crash between the
/// two can duplicate a dead-letter entry (tolerable) but can never lose
/// one. On append failure the original is left pending for redelivery.
async fn dead_letter(
    ctx: &EntryContext,
    entry: &JobEntry,
    partition: &str,
    entry_id: &str,
    error: &str,
) {
    let now = Utc::now().timestamp_millis();
    let fields = entry.dead_letter_fields(error, now);

    match ctx.log.append(&ctx.dlq_partition, &fields).await {
        Ok(_) => {
            ctx.counters.incr(metrics::DLQ);
            warn!(
                partition = %partition,
                entry_id = %entry_id,
                attempt = entry.attempt,
                error = %error,
                "entry dead-lettered"
            );
            ctx.acks.schedule_ack(partition, entry_id).await;
        }
        Err(e) => {
            error!(
                partition = %partition,
                entry_id = %entry_id,
                error = %e,
                "dead-letter append failed, entry stays pending"
            );
        }
    }
}
