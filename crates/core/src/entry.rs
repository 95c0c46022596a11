//! Job entries and their flat field-map wire codec.
//!
//! Entries travel over the log as flat string-to-string maps. Producers are
//! external (and not all of them speak this crate), so the codec is lenient
//! about unknown keys: anything we do not recognize rides along in `extra`
//! and is written back verbatim on requeue/dead-letter.

use std::collections::BTreeMap;

use thiserror::Error;

// Wire field names as the producers emit them.
const FIELD_CCTV_ID: &str = "cctvId";
const FIELD_SOURCE_URL: &str = "hls";
const FIELD_DURATION: &str = "sec";
const FIELD_ATTEMPT: &str = "attempt";
const FIELD_JOB_ID: &str = "jobId";
const FIELD_ENQUEUED_AT: &str = "enqueuedAt";
const FIELD_LAST_ERROR: &str = "last_error";
const FIELD_RETRY_AT: &str = "retry_at";
const FIELD_FINAL_ERROR: &str = "final_error";
const FIELD_DLQ_AT: &str = "dlq_at";

/// Default capture duration when the producer omits `sec`.
pub const DEFAULT_DURATION_SECONDS: u32 = 20;

/// Error raised while decoding or validating an entry's field map.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntryError {
    /// The source URL field is absent or empty.
    #[error("source URL is empty")]
    MissingSource,

    /// A numeric field failed to parse.
    #[error("invalid value for field {field}: {value:?}")]
    InvalidField { field: String, value: String },
}

/// One unit of work: analyze `duration_seconds` of the stream at
/// `source_url` for camera `cctv_id`.
///
/// Entries are immutable once appended to the log; a retry is a brand-new
/// entry derived via [`JobEntry::retry_entry`], never an in-place update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEntry {
    /// Source camera identifier.
    pub cctv_id: String,
    /// Playlist/stream URL to analyze. Required; empty fails validation.
    pub source_url: String,
    /// Seconds of footage to capture.
    pub duration_seconds: u32,
    /// Delivery attempt, starting at 0 and incremented on each requeue.
    pub attempt: u32,
    /// Producer-assigned job id. When absent, the log entry id stands in.
    pub job_id: Option<String>,
    /// When the producer enqueued the job (informational, opaque format).
    pub enqueued_at: Option<String>,
    /// Error message from the attempt that produced this entry, if any.
    pub last_error: Option<String>,
    /// Millisecond timestamp of the requeue, if any (informational).
    pub retry_at: Option<String>,
    /// Unrecognized fields, preserved for wire compatibility.
    pub extra: BTreeMap<String, String>,
}

impl JobEntry {
    /// Build an entry with just a camera and source, defaults elsewhere.
    pub fn new(cctv_id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            cctv_id: cctv_id.into(),
            source_url: source_url.into(),
            duration_seconds: DEFAULT_DURATION_SECONDS,
            attempt: 0,
            job_id: None,
            enqueued_at: None,
            last_error: None,
            retry_at: None,
            extra: BTreeMap::new(),
        }
    }

    /// Decode an entry from a wire field map.
    ///
    /// Unknown keys land in `extra`. Numeric fields must parse; a garbage
    /// `sec` or `attempt` is a decode failure, which callers treat like any
    /// other processing failure (it consumes attempt budget).
    pub fn from_fields<'a, I>(fields: I) -> Result<Self, EntryError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut entry = Self::new("unknown", "");
        for (key, value) in fields {
            match key {
                FIELD_CCTV_ID => entry.cctv_id = value.to_string(),
                FIELD_SOURCE_URL => entry.source_url = value.to_string(),
                FIELD_DURATION => {
                    entry.duration_seconds = parse_u32(FIELD_DURATION, value)?;
                }
                FIELD_ATTEMPT => {
                    entry.attempt = parse_u32(FIELD_ATTEMPT, value)?;
                }
                FIELD_JOB_ID => entry.job_id = Some(value.to_string()),
                FIELD_ENQUEUED_AT => entry.enqueued_at = Some(value.to_string()),
                FIELD_LAST_ERROR => entry.last_error = Some(value.to_string()),
                FIELD_RETRY_AT => entry.retry_at = Some(value.to_string()),
                other => {
                    entry.extra.insert(other.to_string(), value.to_string());
                }
            }
        }

        Ok(entry)
    }

    /// Lenient decode for failure paths: never fails, keeps whatever parses
    /// and defaults the rest. Used to derive requeue/dead-letter copies from
    /// a field map that did not decode strictly.
    pub fn from_fields_lossy<'a, I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut entry = Self::new("unknown", "");
        for (key, value) in fields {
            match key {
                FIELD_CCTV_ID => entry.cctv_id = value.to_string(),
                FIELD_SOURCE_URL => entry.source_url = value.to_string(),
                FIELD_DURATION => {
                    entry.duration_seconds =
                        value.trim().parse().unwrap_or(DEFAULT_DURATION_SECONDS);
                }
                FIELD_ATTEMPT => entry.attempt = value.trim().parse().unwrap_or(0),
                FIELD_JOB_ID => entry.job_id = Some(value.to_string()),
                FIELD_ENQUEUED_AT => entry.enqueued_at = Some(value.to_string()),
                FIELD_LAST_ERROR => entry.last_error = Some(value.to_string()),
                FIELD_RETRY_AT => entry.retry_at = Some(value.to_string()),
                other => {
                    entry.extra.insert(other.to_string(), value.to_string());
                }
            }
        }
        entry
    }

    /// Validate invariants that decoding alone cannot enforce.
    pub fn validate(&self) -> Result<(), EntryError> {
        if self.source_url.is_empty() {
            return Err(EntryError::MissingSource);
        }
        Ok(())
    }

    /// Encode back to the wire field map. Optional fields are omitted when
    /// unset; `extra` is written back verbatim.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (FIELD_CCTV_ID.to_string(), self.cctv_id.clone()),
            (FIELD_SOURCE_URL.to_string(), self.source_url.clone()),
            (FIELD_DURATION.to_string(), self.duration_seconds.to_string()),
            (FIELD_ATTEMPT.to_string(), self.attempt.to_string()),
        ];
        if let Some(job_id) = &self.job_id {
            fields.push((FIELD_JOB_ID.to_string(), job_id.clone()));
        }
        if let Some(enqueued_at) = &self.enqueued_at {
            fields.push((FIELD_ENQUEUED_AT.to_string(), enqueued_at.clone()));
        }
        if let Some(last_error) = &self.last_error {
            fields.push((FIELD_LAST_ERROR.to_string(), last_error.clone()));
        }
        if let Some(retry_at) = &self.retry_at {
            fields.push((FIELD_RETRY_AT.to_string(), retry_at.clone()));
        }
        for (key, value) in &self.extra {
            fields.push((key.clone(), value.clone()));
        }
        fields
    }

    /// The job id to use in logs and upload paths: the producer's when
    /// present, otherwise the log-assigned entry id.
    pub fn job_id_or<'a>(&'a self, entry_id: &'a str) -> &'a str {
        match &self.job_id {
            Some(id) if !id.is_empty() => id,
            _ => entry_id,
        }
    }

    /// Derive the requeue entry for a failed attempt: `attempt + 1`, the
    /// failure recorded in `last_error`, `retry_at` stamped.
    pub fn retry_entry(&self, error: impl Into<String>, now_millis: i64) -> Self {
        let mut next = self.clone();
        next.attempt = self.attempt + 1;
        next.last_error = Some(error.into());
        next.retry_at = Some(now_millis.to_string());
        next
    }

    /// Derive the requeue entry for a congestion deferral. The attempt
    /// budget is untouched; only the deferral reason is recorded.
    pub fn congested_entry(&self, reason: impl Into<String>, now_millis: i64) -> Self {
        let mut next = self.clone();
        next.last_error = Some(reason.into());
        next.retry_at = Some(now_millis.to_string());
        next
    }

    /// Encode the dead-letter form of this entry: the original field set
    /// plus `final_error` and the dead-letter timestamp.
    pub fn dead_letter_fields(
        &self,
        final_error: impl Into<String>,
        now_millis: i64,
    ) -> Vec<(String, String)> {
        let mut fields = self.to_fields();
        fields.push((FIELD_FINAL_ERROR.to_string(), final_error.into()));
        fields.push((FIELD_DLQ_AT.to_string(), now_millis.to_string()));
        fields
    }

    /// Best-effort attempt extraction from a raw field map, for the failure
    /// path when full decoding already failed. Garbage parses as 0.
    pub fn attempt_of<'a, I>(fields: I) -> u32
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        fields
            .into_iter()
            .find(|(k, _)| *k == FIELD_ATTEMPT)
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0)
    }
}

fn parse_u32(field: &str, value: &str) -> Result<u32, EntryError> {
    value.trim().parse().map_err(|_| EntryError::InvalidField {
        field: field.to_string(),
        value: value.to_string(),
    })
}
