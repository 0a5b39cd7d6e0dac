//! Orchestrator actor owning the registry, the TaskBoard and every listener.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shigoto_core::{Job, JobEvent, JobId, ListenerState, MemoryTaskBoard, TaskBoard};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::config::ShigotoConfig;
use crate::listener::{ListenerHandle, ListenerSettings};
use crate::messages::{ShigotoError, ShigotoMessage};
use crate::registry::{Blueprint, JobRegistry, SharedRegistry};
use crate::task::{Task, task_tag};
use crate::worker_pool::{DrainOutcome, WorkerPool};

/// Arguments for starting the orchestrator actor.
pub struct ShigotoArgs {
    pub registry: SharedRegistry,
    pub taskboard: Arc<dyn TaskBoard>,
    pub config: Arc<ShigotoConfig>,
    pub events: broadcast::Sender<JobEvent>,
}

/// State for the orchestrator actor.
pub struct ShigotoState {
    registry: SharedRegistry,
    taskboard: Arc<dyn TaskBoard>,
    config: Arc<ShigotoConfig>,
    events: broadcast::Sender<JobEvent>,
    /// One listener per queue name.
    listeners: HashMap<String, ListenerHandle>,
}

impl ShigotoState {
    fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            pause_policy: self.config.pause_policy,
            read_error_backoff: self.config.read_error_backoff(),
            drain_timeout: self.config.drain_timeout(),
        }
    }

    fn listener(&self, queue: &str) -> Result<&ListenerHandle, ShigotoError> {
        self.listeners
            .get(queue)
            .ok_or_else(|| ShigotoError::NotListening(queue.to_string()))
    }

    async fn enqueue(&self, job: &Job) -> Result<JobId, ShigotoError> {
        let record = job.encode()?;
        self.taskboard.write_job(record, &job.queue_name).await?;

        tracing::debug!(job_id = %job.id, queue = %job.queue_name, "job queued");
        let _ = self.events.send(JobEvent::JobQueued {
            job_id: job.id,
            queue: job.queue_name.clone(),
            payload_type: job.payload_type.clone(),
            timestamp: Utc::now(),
        });
        Ok(job.id)
    }

    fn listen(&mut self, queue: String, workers: usize) -> Result<(), ShigotoError> {
        if self.listeners.contains_key(&queue) {
            return Err(ShigotoError::AlreadyListening(queue));
        }

        let pool = WorkerPool::new(
            queue.clone(),
            workers,
            self.config.max_workers,
            Arc::clone(&self.registry),
            self.events.clone(),
        )?;
        let handle = ListenerHandle::spawn(
            Arc::clone(&self.taskboard),
            pool,
            self.events.clone(),
            self.listener_settings(),
        );

        tracing::info!(queue = %queue, workers, "listening on queue");
        self.listeners.insert(queue, handle);
        Ok(())
    }
}

/// Orchestrator actor.
pub struct ShigotoActor;

impl Actor for ShigotoActor {
    type Msg = ShigotoMessage;
    type State = ShigotoState;
    type Arguments = ShigotoArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let job_types = args.registry.read().await.len();
        tracing::info!(
            job_types,
            default_queue = %args.config.default_queue,
            "starting shigoto orchestrator"
        );

        Ok(ShigotoState {
            registry: args.registry,
            taskboard: args.taskboard,
            config: args.config,
            events: args.events,
            listeners: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ShigotoMessage::Register { blueprint, reply } => {
                let replaced = state.registry.write().await.register(blueprint).is_some();
                let _ = reply.send(replaced);
            }

            ShigotoMessage::Enqueue { job, reply } => {
                let result = state.enqueue(&job).await;
                if let Err(e) = &result {
                    tracing::warn!(error = %e, queue = %job.queue_name, "cannot queue job");
                }
                let _ = reply.send(result);
            }

            ShigotoMessage::ListenQueue {
                queue,
                workers,
                reply,
            } => {
                let _ = reply.send(state.listen(queue, workers));
            }

            ShigotoMessage::PauseQueue { queue, reply } => {
                let _ = reply.send(state.listener(&queue).map(ListenerHandle::pause));
            }

            ShigotoMessage::ResumeQueue { queue, reply } => {
                let _ = reply.send(state.listener(&queue).map(ListenerHandle::unpause));
            }

            ShigotoMessage::StopQueue { queue, reply } => match state.listeners.remove(&queue) {
                Some(mut handle) => {
                    // Draining can take the whole drain window; keep the mailbox moving.
                    tokio::spawn(async move {
                        let outcome = handle.close().await;
                        tracing::info!(queue = %queue, ?outcome, "stopped listening on queue");
                        let _ = reply.send(Ok(outcome));
                    });
                }
                None => {
                    let _ = reply.send(Err(ShigotoError::NotListening(queue)));
                }
            },

            ShigotoMessage::ResizeQueue {
                queue,
                workers,
                reply,
            } => match state.listener(&queue) {
                Ok(handle) => {
                    let pool = Arc::clone(handle.pool());
                    tokio::spawn(async move {
                        let result = pool.resize(workers).await.map_err(ShigotoError::from);
                        let _ = reply.send(result);
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            ShigotoMessage::QueueState { queue, reply } => {
                let _ = reply.send(state.listeners.get(&queue).map(ListenerHandle::state));
            }

            ShigotoMessage::ListQueues { reply } => {
                let mut queues: Vec<String> = state.listeners.keys().cloned().collect();
                queues.sort();
                let _ = reply.send(queues);
            }

            ShigotoMessage::Close { reply } => {
                tracing::info!(listeners = state.listeners.len(), "shutting down orchestrator");
                let closing = state.listeners.drain().map(|(queue, mut handle)| async move {
                    let outcome = handle.close().await;
                    (queue, outcome)
                });
                for (queue, outcome) in join_all(closing).await {
                    match outcome {
                        DrainOutcome::TimedOut { abandoned } => {
                            tracing::warn!(queue = %queue, abandoned, "queue closed with jobs still running")
                        }
                        _ => tracing::info!(queue = %queue, "queue closed"),
                    }
                }

                if let Err(e) = state.taskboard.close().await {
                    tracing::warn!(error = %e, "failed to close taskboard");
                }
                let _ = reply.send(());
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for handle in state.listeners.values() {
            handle.stop();
        }
        tracing::info!("shigoto orchestrator stopped");
        Ok(())
    }
}

/// Builder for a [`Shigoto`] orchestrator.
pub struct ShigotoBuilder {
    taskboard: Option<Arc<dyn TaskBoard>>,
    config: ShigotoConfig,
    registry: JobRegistry,
}

impl ShigotoBuilder {
    /// Use `taskboard` as the queue backend instead of an in-memory board.
    pub fn taskboard(mut self, taskboard: Arc<dyn TaskBoard>) -> Self {
        self.taskboard = Some(taskboard);
        self
    }

    pub fn config(mut self, config: ShigotoConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a job type before the orchestrator starts.
    pub fn register<T: Task>(mut self) -> Self {
        self.registry.register_task::<T>();
        self
    }

    /// Connect the TaskBoard and start the orchestrator actor.
    pub async fn start(self) -> Result<Shigoto, ShigotoError> {
        let taskboard: Arc<dyn TaskBoard> = match self.taskboard {
            Some(taskboard) => taskboard,
            None => Arc::new(MemoryTaskBoard::new()),
        };
        taskboard.initialize().await?;

        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let config = Arc::new(self.config);
        let args = ShigotoArgs {
            registry: self.registry.shared(),
            taskboard,
            config: Arc::clone(&config),
            events: events.clone(),
        };

        let (actor, task) = Actor::spawn(None, ShigotoActor, args)
            .await
            .map_err(|e| ShigotoError::Actor(format!("failed to spawn orchestrator: {}", e)))?;

        Ok(Shigoto {
            actor,
            events,
            config,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

/// Handle to a running orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Shigoto {
    actor: ActorRef<ShigotoMessage>,
    events: broadcast::Sender<JobEvent>,
    config: Arc<ShigotoConfig>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Shigoto {
    pub fn builder() -> ShigotoBuilder {
        ShigotoBuilder {
            taskboard: None,
            config: ShigotoConfig::default(),
            registry: JobRegistry::new(),
        }
    }

    pub fn config(&self) -> &ShigotoConfig {
        &self.config
    }

    /// Receive lifecycle events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Register a job type. Returns true if it replaced an earlier registration.
    pub async fn register<T: Task>(&self) -> Result<bool, ShigotoError> {
        let blueprint = Blueprint::of::<T>();
        self.call(|reply| ShigotoMessage::Register { blueprint, reply })
            .await
    }

    /// Queue `task` on its default queue, or the configured default.
    pub async fn queue<T: Task>(&self, task: &T) -> Result<JobId, ShigotoError> {
        let queue = task
            .default_queue()
            .unwrap_or(&self.config.default_queue)
            .to_string();
        self.queue_to(task, queue).await
    }

    /// Queue `task` on `queue`.
    pub async fn queue_to<T: Task>(
        &self,
        task: &T,
        queue: impl Into<String>,
    ) -> Result<JobId, ShigotoError> {
        let job = Job::new(task.to_payload()?, task_tag::<T>(), queue)
            .with_options(task.job_options());
        let job = Box::new(job);
        self.call(|reply| ShigotoMessage::Enqueue { job, reply })
            .await?
    }

    /// Start consuming `queue` with `workers` concurrent workers.
    pub async fn listen_queue(
        &self,
        queue: impl Into<String>,
        workers: usize,
    ) -> Result<(), ShigotoError> {
        let queue = queue.into();
        self.call(|reply| ShigotoMessage::ListenQueue {
            queue,
            workers,
            reply,
        })
        .await?
    }

    pub async fn pause_queue(&self, queue: impl Into<String>) -> Result<(), ShigotoError> {
        let queue = queue.into();
        self.call(|reply| ShigotoMessage::PauseQueue { queue, reply })
            .await?
    }

    pub async fn resume_queue(&self, queue: impl Into<String>) -> Result<(), ShigotoError> {
        let queue = queue.into();
        self.call(|reply| ShigotoMessage::ResumeQueue { queue, reply })
            .await?
    }

    /// Stop consuming `queue` and drain its workers.
    pub async fn stop_queue(&self, queue: impl Into<String>) -> Result<DrainOutcome, ShigotoError> {
        let queue = queue.into();
        self.call(|reply| ShigotoMessage::StopQueue { queue, reply })
            .await?
    }

    /// Change the worker count of `queue`. Shrinking waits for running jobs.
    pub async fn resize_queue(
        &self,
        queue: impl Into<String>,
        workers: usize,
    ) -> Result<(), ShigotoError> {
        let queue = queue.into();
        self.call(|reply| ShigotoMessage::ResizeQueue {
            queue,
            workers,
            reply,
        })
        .await?
    }

    pub async fn listener_state(
        &self,
        queue: impl Into<String>,
    ) -> Result<Option<ListenerState>, ShigotoError> {
        let queue = queue.into();
        self.call(|reply| ShigotoMessage::QueueState { queue, reply })
            .await
    }

    /// Names of queues with an active listener.
    pub async fn queues(&self) -> Result<Vec<String>, ShigotoError> {
        self.call(|reply| ShigotoMessage::ListQueues { reply }).await
    }

    /// Stop every listener, drain their pools and close the TaskBoard.
    /// Later calls return immediately.
    pub async fn close(&self) -> Result<(), ShigotoError> {
        let mut task = self.task.lock().await;
        let Some(handle) = task.take() else {
            return Ok(());
        };

        self.call(|reply| ShigotoMessage::Close { reply }).await?;
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "orchestrator task ended abnormally");
        }
        Ok(())
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(RpcReplyPort<T>) -> ShigotoMessage,
    ) -> Result<T, ShigotoError>
    where
        T: Send + 'static,
    {
        match self.actor.call(build, None).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(ShigotoError::Actor("orchestrator call timed out".into())),
            Ok(CallResult::SenderError) => {
                Err(ShigotoError::Actor("orchestrator dropped the reply".into()))
            }
            Err(_) => Err(ShigotoError::Actor("orchestrator is not running".into())),
        }
    }
}
