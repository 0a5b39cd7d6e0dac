//! Background job dispatch on top of a pluggable TaskBoard.
//!
//! This crate provides the job registry, per-queue listeners, elastic
//! worker pools and the Ractor-based orchestrator that ties them together.
//!
//! # Architecture
//!
//! - `ShigotoActor` - Orchestrator owning the registry, the TaskBoard and all listeners
//! - `ListenerHandle` - Pulls records for one queue and hands them to its pool
//! - `WorkerPool` - Bounds how many jobs of a queue run at once
//!
//! # Usage
//!
//! ```ignore
//! use shigoto::Shigoto;
//!
//! let shigoto = Shigoto::builder().register::<SendEmail>().start().await?;
//! shigoto.listen_queue("mail", 4).await?;
//! shigoto.queue_to(&SendEmail { to: "a@b.c".into() }, "mail").await?;
//! shigoto.close().await?;
//! ```

pub mod config;
mod listener;
mod messages;
pub mod registry;
mod supervisor;
pub mod task;
mod worker_pool;

pub use config::{ConfigError, ShigotoConfig};
pub use listener::{ListenerCommand, ListenerHandle, ListenerSettings};
pub use messages::{ShigotoError, ShigotoMessage};
pub use registry::{Blueprint, JobRegistry, RegistryError, SharedRegistry};
pub use supervisor::{Shigoto, ShigotoActor, ShigotoArgs, ShigotoBuilder};
pub use task::{RunError, RunFuture, RunResult, Runner, Task, task_tag};
pub use worker_pool::{DrainOutcome, PoolError, Slot, WorkerPool};

pub use shigoto_core::{
    FailureKind, Job, JobError, JobEvent, JobId, JobOptions, JobStatus, ListenerState,
    MemoryTaskBoard, PausePolicy, PoolState, TaskBoard, TaskBoardError,
};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef};
