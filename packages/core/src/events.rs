//! Lifecycle events broadcast by the dispatch pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, ListenerState};

/// Why a job did not finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Payload checksum mismatch.
    Corrupted,
    Expired,
    /// No blueprint registered for the payload type.
    NotRegistered,
    /// Payload could not be decoded into the registered type.
    Undecodable,
    /// `run()` returned an error.
    Run,
    Panicked,
    /// `run()` exceeded the job's max run time.
    TimedOut,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Corrupted => "corrupted",
            FailureKind::Expired => "expired",
            FailureKind::NotRegistered => "not_registered",
            FailureKind::Undecodable => "undecodable",
            FailureKind::Run => "run",
            FailureKind::Panicked => "panicked",
            FailureKind::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Events emitted by the job queue system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job was written to a queue.
    JobQueued {
        job_id: JobId,
        queue: String,
        payload_type: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker began running a job.
    JobStarted {
        job_id: JobId,
        queue: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// A job's `run()` returned successfully.
    JobFinished {
        job_id: JobId,
        queue: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job was aborted or its `run()` failed.
    JobFailed {
        job_id: JobId,
        queue: String,
        kind: FailureKind,
        error: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    /// A raw record could not be decoded into a job and was discarded.
    RecordDropped {
        queue: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A listener moved between states.
    ListenerStateChanged {
        queue: String,
        old_state: ListenerState,
        new_state: ListenerState,
        timestamp: DateTime<Utc>,
    },
    /// A worker pool changed capacity.
    PoolResized {
        queue: String,
        old_capacity: usize,
        new_capacity: usize,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobQueued { timestamp, .. }
            | JobEvent::JobStarted { timestamp, .. }
            | JobEvent::JobFinished { timestamp, .. }
            | JobEvent::JobFailed { timestamp, .. }
            | JobEvent::RecordDropped { timestamp, .. }
            | JobEvent::ListenerStateChanged { timestamp, .. }
            | JobEvent::PoolResized { timestamp, .. } => *timestamp,
        }
    }

    /// Get the queue name associated with this event.
    pub fn queue(&self) -> &str {
        match self {
            JobEvent::JobQueued { queue, .. }
            | JobEvent::JobStarted { queue, .. }
            | JobEvent::JobFinished { queue, .. }
            | JobEvent::JobFailed { queue, .. }
            | JobEvent::RecordDropped { queue, .. }
            | JobEvent::ListenerStateChanged { queue, .. }
            | JobEvent::PoolResized { queue, .. } => queue,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobQueued { job_id, .. }
            | JobEvent::JobStarted { job_id, .. }
            | JobEvent::JobFinished { job_id, .. }
            | JobEvent::JobFailed { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobQueued {
                job_id,
                queue,
                payload_type,
                ..
            } => format!("Job {} ({}) queued to '{}'", job_id, payload_type, queue),
            JobEvent::JobStarted {
                job_id, attempt, ..
            } => format!("Job {} started (attempt {})", job_id, attempt),
            JobEvent::JobFinished {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} finished in {}ms", job_id, duration_ms),
            JobEvent::JobFailed {
                job_id,
                kind,
                error,
                ..
            } => format!("Job {} failed ({}): {}", job_id, kind, error),
            JobEvent::RecordDropped { queue, error, .. } => {
                format!("Record dropped from '{}': {}", queue, error)
            }
            JobEvent::ListenerStateChanged {
                queue, new_state, ..
            } => format!("Listener '{}' -> {}", queue, new_state),
            JobEvent::PoolResized {
                queue,
                old_capacity,
                new_capacity,
                ..
            } => format!(
                "Pool '{}' resized {} -> {}",
                queue, old_capacity, new_capacity
            ),
        }
    }
}
