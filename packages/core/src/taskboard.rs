//! The durable queue contract and an in-memory implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

/// TaskBoard errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskBoardError {
    #[error("cannot connect to taskboard: {0}")]
    Connection(String),

    #[error("cannot read from queue '{queue}': {reason}")]
    Read { queue: String, reason: String },

    #[error("cannot write to queue '{queue}': {reason}")]
    Write { queue: String, reason: String },

    #[error("cannot close taskboard: {0}")]
    Close(String),

    #[error("taskboard is closed")]
    Closed,
}

/// Backend that stores encoded job records in named FIFO queues.
///
/// Implementations own their concurrency safety. `read_job` may wait
/// until a record is available; callers are expected to race it against
/// their own control signals and may drop the future at any await point.
#[async_trait]
pub trait TaskBoard: Send + Sync + 'static {
    /// Establish backend connectivity. Called once at startup.
    async fn initialize(&self) -> Result<(), TaskBoardError>;

    /// Append a record to the tail of `queue`.
    async fn write_job(&self, record: Vec<u8>, queue: &str) -> Result<(), TaskBoardError>;

    /// Remove and return the record at the head of `queue`.
    async fn read_job(&self, queue: &str) -> Result<Vec<u8>, TaskBoardError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), TaskBoardError>;
}

#[derive(Default)]
struct QueueSlot {
    records: Mutex<VecDeque<Vec<u8>>>,
    ready: Notify,
}

/// Process-local TaskBoard backed by per-queue deques.
///
/// Reads block until a writer pushes to the same queue or the board closes.
#[derive(Default)]
pub struct MemoryTaskBoard {
    queues: Mutex<HashMap<String, Arc<QueueSlot>>>,
    closed: AtomicBool,
}

impl MemoryTaskBoard {
    /// Create a new empty board.
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, queue: &str) -> Arc<QueueSlot> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default().clone()
    }

    /// Number of records waiting in `queue`.
    pub async fn len(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        match queues.get(queue) {
            Some(slot) => slot.records.lock().await.len(),
            None => 0,
        }
    }

    /// Check whether `queue` has no waiting records.
    pub async fn is_empty(&self, queue: &str) -> bool {
        self.len(queue).await == 0
    }

    fn ensure_open(&self) -> Result<(), TaskBoardError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TaskBoardError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TaskBoard for MemoryTaskBoard {
    async fn initialize(&self) -> Result<(), TaskBoardError> {
        self.ensure_open()?;
        tracing::debug!("memory taskboard ready");
        Ok(())
    }

    async fn write_job(&self, record: Vec<u8>, queue: &str) -> Result<(), TaskBoardError> {
        self.ensure_open()?;
        let slot = self.slot(queue).await;
        slot.records.lock().await.push_back(record);
        slot.ready.notify_one();
        Ok(())
    }

    async fn read_job(&self, queue: &str) -> Result<Vec<u8>, TaskBoardError> {
        let slot = self.slot(queue).await;
        loop {
            let notified = slot.ready.notified();
            tokio::pin!(notified);
            // Register before checking so a write or close in between is not missed.
            notified.as_mut().enable();

            self.ensure_open()?;
            if let Some(record) = slot.records.lock().await.pop_front() {
                return Ok(record);
            }
            notified.await;
        }
    }

    async fn close(&self) -> Result<(), TaskBoardError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let queues = self.queues.lock().await;
        for slot in queues.values() {
            slot.ready.notify_waiters();
        }
        tracing::debug!("memory taskboard closed");
        Ok(())
    }
}
