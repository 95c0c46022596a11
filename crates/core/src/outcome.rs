//! Processing outcomes and the retry/dead-letter decision.
//!
//! The per-entry handler reports what happened as an explicit value
//! ([`EntryOutcome`]) and [`decide`] maps it to the action the worker takes.
//! Keeping the decision a pure function makes the delivery policy testable
//! without a log or a pipeline in the loop.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Classification returned by the analysis pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// The pipeline produced its primary results.
    Success,
    /// The pipeline ran but some stages produced nothing usable.
    PartialSuccess,
    /// The upstream video source could not be reached at all.
    UpstreamUnreachable,
}

/// One file produced by the pipeline, staged in the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Artifact kind tag (e.g. `background_image`, `error_log`).
    pub kind: String,
    /// Absolute path inside the scratch directory.
    pub path: PathBuf,
    /// Object name to upload under.
    pub filename: String,
}

/// Structured result of one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessReport {
    pub status: ProcessStatus,
    /// Files to export before acknowledging.
    pub artifacts: Vec<ArtifactDescriptor>,
    /// Diagnostic metadata; opaque to the worker, uploaded alongside.
    pub meta: serde_json::Value,
    /// Scratch directory to remove once artifacts are exported.
    pub scratch_dir: Option<PathBuf>,
}

impl ProcessReport {
    pub fn new(status: ProcessStatus) -> Self {
        Self {
            status,
            artifacts: Vec::new(),
            meta: serde_json::Value::Null,
            scratch_dir: None,
        }
    }
}

/// What happened to one delivered entry, from the worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// The resource guard refused admission; the pipeline never ran.
    Congested,
    /// The pipeline ran and classified the job.
    Processed(ProcessStatus),
    /// Validation, the pipeline, or the artifact export failed outright.
    Failed(String),
}

/// Attempt budgets governing the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimits {
    /// General budget: entries with `attempt >= max_retry` dead-letter on
    /// the next failure.
    pub max_retry: u32,
    /// Smaller dedicated budget for an unreachable source; once exhausted
    /// the job completes with its error artifacts instead of retrying.
    pub source_retry_limit: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            max_retry: 3,
            source_retry_limit: 3,
        }
    }
}

/// The action the worker takes for an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Export artifacts, acknowledge, count as processed.
    Complete,
    /// Append a derived copy; the original stays pending (unacknowledged).
    Requeue {
        error: String,
        /// Whether the copy's `attempt` is incremented. Congestion does not
        /// consume attempt budget; failures and source retries do.
        counts_attempt: bool,
    },
    /// Append to the dead-letter partition, then acknowledge the original.
    DeadLetter { error: String },
}

/// Map an outcome to a disposition. Pure; `attempt` is the delivered
/// entry's attempt number as it arrived.
pub fn decide(outcome: &EntryOutcome, attempt: u32, limits: RetryLimits) -> Disposition {
    match outcome {
        EntryOutcome::Congested => Disposition::Requeue {
            error: "resource guard reported no headroom".to_string(),
            counts_attempt: false,
        },
        EntryOutcome::Processed(ProcessStatus::Success)
        | EntryOutcome::Processed(ProcessStatus::PartialSuccess) => Disposition::Complete,
        EntryOutcome::Processed(ProcessStatus::UpstreamUnreachable) => {
            if attempt < limits.source_retry_limit {
                Disposition::Requeue {
                    error: "upstream source unreachable".to_string(),
                    counts_attempt: true,
                }
            } else {
                // The source stayed down through its whole budget; record
                // what we have and stop redelivering.
                Disposition::Complete
            }
        }
        EntryOutcome::Failed(error) => {
            if attempt < limits.max_retry {
                Disposition::Requeue {
                    error: error.clone(),
                    counts_attempt: true,
                }
            } else {
                Disposition::DeadLetter {
                    error: error.clone(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: RetryLimits = RetryLimits {
        max_retry: 3,
        source_retry_limit: 3,
    };

    #[test]
    fn success_and_partial_success_complete() {
        for status in [ProcessStatus::Success, ProcessStatus::PartialSuccess] {
            let d = decide(&EntryOutcome::Processed(status), 0, LIMITS);
            assert_eq!(d, Disposition::Complete);
        }
    }

    #[test]
    fn congestion_requeues_without_consuming_budget() {
        // Even an entry already at the retry limit is deferred, not killed.
        let d = decide(&EntryOutcome::Congested, 3, LIMITS);
        assert!(matches!(
            d,
            Disposition::Requeue {
                counts_attempt: false,
                ..
            }
        ));
    }

    #[test]
    fn failures_requeue_until_budget_exhausted() {
        for attempt in 0..3 {
            let d = decide(&EntryOutcome::Failed("boom".into()), attempt, LIMITS);
            assert!(
                matches!(
                    d,
                    Disposition::Requeue {
                        counts_attempt: true,
                        ..
                    }
                ),
                "attempt {attempt} should requeue"
            );
        }

        let d = decide(&EntryOutcome::Failed("boom".into()), 3, LIMITS);
        assert_eq!(
            d,
            Disposition::DeadLetter {
                error: "boom".into()
            }
        );
    }

    #[test]
    fn unreachable_source_has_its_own_smaller_budget() {
        let unreachable = EntryOutcome::Processed(ProcessStatus::UpstreamUnreachable);

        for attempt in 0..3 {
            let d = decide(&unreachable, attempt, LIMITS);
            assert!(matches!(
                d,
                Disposition::Requeue {
                    counts_attempt: true,
                    ..
                }
            ));
        }

        // Budget spent: demoted to a recorded completion, never dead-lettered.
        assert_eq!(decide(&unreachable, 3, LIMITS), Disposition::Complete);
        assert_eq!(decide(&unreachable, 7, LIMITS), Disposition::Complete);
    }

    #[test]
    fn dead_letter_preserves_error_text() {
        let d = decide(&EntryOutcome::Failed("no frames decoded".into()), 5, LIMITS);
        assert_eq!(
            d,
            Disposition::DeadLetter {
                error: "no frames decoded".into()
            }
        );
    }
}
