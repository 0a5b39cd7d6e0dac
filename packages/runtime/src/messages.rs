//! Message and error types for the orchestrator actor.

use ractor::RpcReplyPort;
use shigoto_core::{Job, JobError, JobId, ListenerState, TaskBoardError};

use crate::registry::Blueprint;
use crate::worker_pool::{DrainOutcome, PoolError};

/// Messages for the orchestrator actor.
#[derive(Debug)]
pub enum ShigotoMessage {
    /// Add a job type to the registry. Replies true if it replaced one.
    Register {
        blueprint: Blueprint,
        reply: RpcReplyPort<bool>,
    },

    /// Write an encoded job to its queue.
    Enqueue {
        job: Box<Job>,
        reply: RpcReplyPort<Result<JobId, ShigotoError>>,
    },

    /// Start a listener and worker pool for a queue.
    ListenQueue {
        queue: String,
        workers: usize,
        reply: RpcReplyPort<Result<(), ShigotoError>>,
    },

    /// Pause intake on a queue.
    PauseQueue {
        queue: String,
        reply: RpcReplyPort<Result<(), ShigotoError>>,
    },

    /// Resume intake on a paused queue.
    ResumeQueue {
        queue: String,
        reply: RpcReplyPort<Result<(), ShigotoError>>,
    },

    /// Close one listener and drain its pool.
    StopQueue {
        queue: String,
        reply: RpcReplyPort<Result<DrainOutcome, ShigotoError>>,
    },

    /// Change the worker count of a queue.
    ResizeQueue {
        queue: String,
        workers: usize,
        reply: RpcReplyPort<Result<(), ShigotoError>>,
    },

    /// Current listener state of a queue, if one is running.
    QueueState {
        queue: String,
        reply: RpcReplyPort<Option<ListenerState>>,
    },

    /// Names of all queues with a listener.
    ListQueues { reply: RpcReplyPort<Vec<String>> },

    /// Close every listener, then the TaskBoard.
    Close { reply: RpcReplyPort<()> },
}

/// Error type for orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum ShigotoError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error("taskboard error: {0}")]
    TaskBoard(#[from] TaskBoardError),

    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("cannot encode task payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("queue '{0}' already has a listener")]
    AlreadyListening(String),

    #[error("queue '{0}' has no listener")]
    NotListening(String),

    #[error("actor error: {0}")]
    Actor(String),
}
