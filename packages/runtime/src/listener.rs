//! Per-queue intake loop feeding a worker pool.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shigoto_core::{Job, JobEvent, ListenerState, PausePolicy, TaskBoard, TaskBoardError};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::worker_pool::{DrainOutcome, PoolError, Slot, WorkerPool};

/// Control signals accepted by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerCommand {
    Pause,
    Resume,
    Stop,
}

/// Timing and policy knobs for a listener.
#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    pub pause_policy: PausePolicy,
    pub read_error_backoff: Duration,
    pub drain_timeout: Duration,
}

enum Pulled {
    Record(Vec<u8>),
    ReadFailed(TaskBoardError),
    Interrupted,
}

/// The intake loop. Only this task writes the listener state; everyone
/// else talks to it through the control channel.
struct Listener {
    queue: String,
    state: watch::Sender<ListenerState>,
    control: mpsc::UnboundedReceiver<ListenerCommand>,
    deferred: VecDeque<ListenerCommand>,
    taskboard: Arc<dyn TaskBoard>,
    pool: Arc<WorkerPool>,
    events: broadcast::Sender<JobEvent>,
    settings: ListenerSettings,
}

impl Listener {
    /// Start a listener for `pool.queue()` on its own task.
    fn spawn(
        taskboard: Arc<dyn TaskBoard>,
        pool: Arc<WorkerPool>,
        events: broadcast::Sender<JobEvent>,
        settings: ListenerSettings,
    ) -> ListenerHandle {
        let queue = pool.queue().to_string();
        let (state_tx, state_rx) = watch::channel(ListenerState::Initializing);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let listener = Listener {
            queue: queue.clone(),
            state: state_tx,
            control: control_rx,
            deferred: VecDeque::new(),
            taskboard,
            pool: Arc::clone(&pool),
            events,
            settings,
        };
        let span = tracing::info_span!("listener", queue = %queue);
        let task = tokio::spawn(listener.listen().instrument(span));

        ListenerHandle {
            queue,
            control: control_tx,
            state: state_rx,
            pool,
            task: Some(task),
            drain_timeout: settings.drain_timeout,
        }
    }

    async fn listen(mut self) {
        self.transition(ListenerState::Listening);

        loop {
            if let Some(command) = self.next_command() {
                if self.apply(command).is_break() {
                    return;
                }
                continue;
            }

            if *self.state.borrow() != ListenerState::Listening {
                let command = self.control.recv().await.unwrap_or(ListenerCommand::Stop);
                self.deferred.push_back(command);
                continue;
            }

            match self.pull().await {
                Pulled::Record(raw) => self.hand_off(raw).await,
                Pulled::ReadFailed(e) => {
                    tracing::warn!(error = %e, "cannot read job from taskboard");
                    self.backoff().await;
                }
                Pulled::Interrupted => {}
            }
        }
    }

    fn next_command(&mut self) -> Option<ListenerCommand> {
        if let Some(command) = self.deferred.pop_front() {
            return Some(command);
        }
        match self.control.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty) => None,
            // Every handle is gone; nobody can resume us.
            Err(TryRecvError::Disconnected) => Some(ListenerCommand::Stop),
        }
    }

    fn apply(&mut self, command: ListenerCommand) -> ControlFlow<()> {
        let current = *self.state.borrow();
        match (command, current) {
            (ListenerCommand::Stop, _) => {
                self.transition(ListenerState::Stopping);
                self.transition(ListenerState::Stopped);
                return ControlFlow::Break(());
            }
            (ListenerCommand::Pause, ListenerState::Listening) => {
                self.transition(ListenerState::Pausing);
                self.transition(ListenerState::Paused);
            }
            (ListenerCommand::Resume, ListenerState::Paused) => {
                self.transition(ListenerState::Resuming);
                self.transition(ListenerState::Listening);
            }
            (command, state) => {
                tracing::debug!(?command, %state, "ignoring control signal");
            }
        }
        ControlFlow::Continue(())
    }

    fn transition(&self, next: ListenerState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        tracing::info!(from = %previous, to = %next, "listener state changed");
        let _ = self.events.send(JobEvent::ListenerStateChanged {
            queue: self.queue.clone(),
            old_state: previous,
            new_state: next,
            timestamp: Utc::now(),
        });
    }

    /// Read one record, giving way to control signals while the read waits.
    async fn pull(&mut self) -> Pulled {
        let taskboard = Arc::clone(&self.taskboard);
        let queue = self.queue.clone();
        let read = async move { taskboard.read_job(&queue).await };
        tokio::pin!(read);

        loop {
            let command = tokio::select! {
                biased;
                command = self.control.recv() => command.unwrap_or(ListenerCommand::Stop),
                result = &mut read => {
                    return match result {
                        Ok(raw) => Pulled::Record(raw),
                        Err(e) => Pulled::ReadFailed(e),
                    };
                }
            };

            match command {
                ListenerCommand::Stop => {
                    self.deferred.push_front(command);
                    return Pulled::Interrupted;
                }
                _ if self.settings.pause_policy == PausePolicy::Immediate => {
                    self.deferred.push_back(command);
                    return Pulled::Interrupted;
                }
                // Applied once the pending read returns.
                _ => self.deferred.push_back(command),
            }
        }
    }

    /// Decode a record and pass it to a free worker slot.
    async fn hand_off(&mut self, raw: Vec<u8>) {
        let job = match Job::decode(&raw) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(error = %e, bytes = raw.len(), "dropping malformed job record");
                let _ = self.events.send(JobEvent::RecordDropped {
                    queue: self.queue.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                return;
            }
        };

        let pool = Arc::clone(&self.pool);
        let acquire = pool.acquire();
        tokio::pin!(acquire);

        let slot: Result<Slot, PoolError> = loop {
            let command = tokio::select! {
                biased;
                command = self.control.recv() => command.unwrap_or(ListenerCommand::Stop),
                slot = &mut acquire => break slot,
            };
            if command == ListenerCommand::Stop {
                self.deferred.push_front(command);
                self.requeue(raw, &job).await;
                return;
            }
            self.deferred.push_back(command);
        };

        match slot {
            Ok(slot) => {
                tracing::debug!(job_id = %job.id, "dispatching job");
                pool.dispatch(slot, job);
            }
            Err(e) => {
                tracing::warn!(error = %e, job_id = %job.id, "no worker slot for job");
                self.requeue(raw, &job).await;
            }
        }
    }

    /// Put an undispatched record back on the tail of the queue.
    async fn requeue(&self, raw: Vec<u8>, job: &Job) {
        match self.taskboard.write_job(raw, &self.queue).await {
            Ok(()) => tracing::info!(job_id = %job.id, "returned undispatched job to queue"),
            Err(e) => tracing::error!(error = %e, job = ?job, "lost undispatched job"),
        }
    }

    /// Idle after a failed read unless a control signal arrives first.
    async fn backoff(&mut self) {
        let command = tokio::select! {
            biased;
            command = self.control.recv() => Some(command.unwrap_or(ListenerCommand::Stop)),
            _ = tokio::time::sleep(self.settings.read_error_backoff) => None,
        };
        if let Some(command) = command {
            self.deferred.push_back(command);
        }
    }
}

/// Owner-side handle to a running listener.
pub struct ListenerHandle {
    queue: String,
    control: mpsc::UnboundedSender<ListenerCommand>,
    state: watch::Receiver<ListenerState>,
    pool: Arc<WorkerPool>,
    task: Option<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl ListenerHandle {
    /// Start listening on `pool.queue()`.
    pub fn spawn(
        taskboard: Arc<dyn TaskBoard>,
        pool: Arc<WorkerPool>,
        events: broadcast::Sender<JobEvent>,
        settings: ListenerSettings,
    ) -> Self {
        Listener::spawn(taskboard, pool, events, settings)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Wait until the listener reaches `target`. Returns false if it
    /// stopped without ever getting there.
    pub async fn wait_for(&self, target: ListenerState) -> bool {
        let mut state = self.state.clone();
        let reached = match state.wait_for(|s| *s == target || s.is_terminal()).await {
            Ok(reached) => *reached,
            Err(_) => return *self.state.borrow() == target,
        };
        reached == target
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Stop pulling new records. No-op unless listening.
    pub fn pause(&self) {
        self.signal(ListenerCommand::Pause);
    }

    /// Resume pulling. No-op unless paused.
    pub fn unpause(&self) {
        self.signal(ListenerCommand::Resume);
    }

    pub fn stop(&self) {
        self.signal(ListenerCommand::Stop);
    }

    fn signal(&self, command: ListenerCommand) {
        if self.control.send(command).is_err() {
            tracing::debug!(queue = %self.queue, ?command, "listener already stopped");
        }
    }

    /// Resize the worker pool behind this listener.
    pub async fn resize(&self, workers: usize) -> Result<(), PoolError> {
        self.pool.resize(workers).await
    }

    /// Stop the listener, wait for its loop to exit, then drain the pool.
    /// Safe to call more than once.
    pub async fn close(&mut self) -> DrainOutcome {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(queue = %self.queue, error = %e, "listener task ended abnormally");
            }
        }
        self.pool.close(self.drain_timeout).await
    }
}
