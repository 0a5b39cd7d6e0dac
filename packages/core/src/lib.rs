//! Core types for the shigoto job queue.
//!
//! This crate contains the pieces shared by producers and workers:
//! - Job, JobStatus and JobOptions for work items
//! - The TaskBoard contract and an in-memory board
//! - Listener and pool state enums
//! - Events for observing the pipeline

mod events;
mod job;
mod state;
mod taskboard;

pub use events::{FailureKind, JobEvent};
pub use job::{Job, JobError, JobId, JobOptions, JobStatus, checksum};
pub use state::{ListenerState, PausePolicy, PoolState};
pub use taskboard::{MemoryTaskBoard, TaskBoard, TaskBoardError};
