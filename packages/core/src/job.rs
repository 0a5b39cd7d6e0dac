//! Job record: the unit of work exchanged with a TaskBoard.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a job. Transitions only move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Written to a queue, waiting for a worker.
    #[default]
    Queued,
    /// Currently executing.
    Running,
    Canceled,
    Failed,
    Finished,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Canceled | JobStatus::Failed | JobStatus::Finished
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Canceled => "canceled",
            JobStatus::Failed => "failed",
            JobStatus::Finished => "finished",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while creating, decoding or validating a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("cannot encode job: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("cannot decode job record: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("payload checksum {actual:#010x} does not match integrity tag {expected:#010x}")]
    Corrupted { expected: u32, actual: u32 },

    #[error(
        "job has expired. queued at: {} expires at: {} now: {}",
        .queued_at.format(TIMESTAMP_FORMAT),
        .deadline.format(TIMESTAMP_FORMAT),
        .now.format(TIMESTAMP_FORMAT)
    )]
    Expired {
        queued_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    },
}

/// Per-job execution limits chosen by the producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Advisory attempt limit. Nothing re-enqueues on failure.
    pub max_attempts: u32,
    /// Upper bound on a single `run()`; zero means unbounded.
    pub max_run_time: Duration,
    /// Time after queueing past which the job is discarded; zero means never.
    pub expire_after: Duration,
}

impl JobOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = max_run_time;
        self
    }

    pub fn with_expire_after(mut self, expire_after: Duration) -> Self {
        self.expire_after = expire_after;
        self
    }
}

/// A job as stored on a TaskBoard.
///
/// The wire form is camelCase JSON; `payload` is carried opaquely and
/// `payloadType` selects the registered blueprint that decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub status: JobStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default, with = "duration_ms")]
    pub max_run_time: Duration,
    #[serde(default, with = "duration_ms")]
    pub expire_after: Duration,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub payload_type: String,
    /// Opaque task payload, base64 on the wire.
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    /// CRC-32 of `payload`; `0` disables the integrity check.
    #[serde(default)]
    pub integrity_tag: u32,
    /// Last failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Build a queued job, stamping identity, queue time and integrity tag.
    pub fn new(
        payload: Vec<u8>,
        payload_type: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        let integrity_tag = checksum(&payload);
        Self {
            id: JobId::new(),
            queue_name: queue_name.into(),
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: 0,
            max_run_time: Duration::ZERO,
            expire_after: Duration::ZERO,
            queued_at: Utc::now(),
            started_at: None,
            failed_at: None,
            finished_at: None,
            payload_type: payload_type.into(),
            payload,
            integrity_tag,
            error: None,
        }
    }

    /// Create a job and encode it into the record written to a TaskBoard.
    pub fn create(
        payload: Vec<u8>,
        payload_type: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Result<Vec<u8>, JobError> {
        Self::new(payload, payload_type, queue_name).encode()
    }

    /// Apply producer-chosen limits.
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.max_attempts = options.max_attempts;
        self.max_run_time = options.max_run_time;
        self.expire_after = options.expire_after;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, JobError> {
        serde_json::to_vec(self).map_err(JobError::Encode)
    }

    pub fn decode(record: &[u8]) -> Result<Self, JobError> {
        serde_json::from_slice(record).map_err(JobError::Decode)
    }

    /// Recompute the payload checksum and compare it with the integrity tag.
    pub fn verify_integrity(&self) -> Result<(), JobError> {
        if self.integrity_tag == 0 {
            return Ok(());
        }
        let actual = checksum(&self.payload);
        if actual == self.integrity_tag {
            Ok(())
        } else {
            Err(JobError::Corrupted {
                expected: self.integrity_tag,
                actual,
            })
        }
    }

    /// The instant after which the job counts as expired, if it can expire.
    ///
    /// An `expire_after` too large for the calendar clamps to the latest
    /// representable instant; only zero means "never".
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        if self.expire_after.is_zero() {
            return None;
        }
        let deadline = TimeDelta::from_std(self.expire_after)
            .ok()
            .and_then(|delta| self.queued_at.checked_add_signed(delta));
        Some(deadline.unwrap_or_else(|| {
            tracing::warn!(
                job_id = %self.id,
                expire_after = ?self.expire_after,
                "expiry out of range, clamping deadline"
            );
            DateTime::<Utc>::MAX_UTC
        }))
    }

    /// Fail the job if `now` is past its deadline.
    pub fn check_expiry(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        let Some(deadline) = self.deadline() else {
            return Ok(());
        };
        if now <= deadline {
            return Ok(());
        }
        let err = JobError::Expired {
            queued_at: self.queued_at,
            deadline,
            now,
        };
        self.mark_failed(now, err.to_string());
        Err(err)
    }

    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.status = JobStatus::Running;
        self.started_at = Some(now);
    }

    pub fn mark_finished(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Finished;
        self.finished_at = Some(now);
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.failed_at = Some(now);
        self.error = Some(error.into());
    }
}

/// CRC-32 (IEEE) over a payload.
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod payload_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}
