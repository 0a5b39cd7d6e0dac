//! Elastic pool of execution slots for one queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use shigoto_core::{FailureKind, Job, JobEvent, PoolState};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::registry::{RegistryError, SharedRegistry};

/// Worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("requested {requested} workers exceeds the limit of {max}")]
    CapacityExceeded { requested: usize, max: usize },

    #[error("worker pool is closed")]
    Closed,
}

/// How a pool close ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight job returned its slot.
    Drained,
    /// The drain window elapsed; `abandoned` jobs were still running.
    TimedOut { abandoned: usize },
    AlreadyClosed,
}

/// Authorization to run one job. Dropping it returns the slot to the pool.
pub struct Slot {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<watch::Sender<usize>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Token pool bounding concurrent job execution for a queue.
///
/// Each of `capacity` semaphore permits authorizes one running job. The
/// permit travels with the job's task and is released when that task ends,
/// on success, failure or panic alike.
pub struct WorkerPool {
    queue: String,
    slots: Arc<Semaphore>,
    capacity: AtomicUsize,
    max_capacity: usize,
    resize_lock: Mutex<()>,
    state: watch::Sender<PoolState>,
    in_flight: Arc<watch::Sender<usize>>,
    registry: SharedRegistry,
    events: broadcast::Sender<JobEvent>,
}

impl WorkerPool {
    /// Create a running pool with `capacity` slots.
    pub fn new(
        queue: impl Into<String>,
        capacity: usize,
        max_capacity: usize,
        registry: SharedRegistry,
        events: broadcast::Sender<JobEvent>,
    ) -> Result<Arc<Self>, PoolError> {
        if capacity > max_capacity {
            return Err(PoolError::CapacityExceeded {
                requested: capacity,
                max: max_capacity,
            });
        }

        let (state, _) = watch::channel(PoolState::Initializing);
        let (in_flight, _) = watch::channel(0);
        let pool = Self {
            queue: queue.into(),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            max_capacity,
            resize_lock: Mutex::new(()),
            state,
            in_flight: Arc::new(in_flight),
            registry,
            events,
        };
        pool.state.send_replace(PoolState::Running);
        tracing::debug!(queue = %pool.queue, capacity, "worker pool running");
        Ok(Arc::new(pool))
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Target number of concurrent slots.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Jobs currently holding a slot.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<Slot, PoolError> {
        if self.state() == PoolState::Closing {
            return Err(PoolError::Closed);
        }
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        self.in_flight.send_modify(|n| *n += 1);
        Ok(Slot {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Run `job` on its own task, holding `slot` until the task ends.
    pub fn dispatch(self: &Arc<Self>, slot: Slot, job: Job) -> JoinHandle<()> {
        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            queue = %self.queue,
            payload_type = %job.payload_type,
        );
        let pool = Arc::clone(self);
        tokio::spawn(
            async move {
                let _slot = slot;
                pool.execute(job).await;
            }
            .instrument(span),
        )
    }

    /// Change the number of slots.
    ///
    /// Growing takes effect at once. Shrinking waits until enough running
    /// jobs have returned their slots and never interrupts them.
    pub async fn resize(&self, capacity: usize) -> Result<(), PoolError> {
        if capacity > self.max_capacity {
            return Err(PoolError::CapacityExceeded {
                requested: capacity,
                max: self.max_capacity,
            });
        }

        let _guard = self.resize_lock.lock().await;
        if self.state() == PoolState::Closing {
            return Err(PoolError::Closed);
        }

        let current = self.capacity();
        if capacity == current {
            return Ok(());
        }

        if capacity > current {
            self.slots.add_permits(capacity - current);
        } else {
            let excess = u32::try_from(current - capacity).map_err(|_| {
                PoolError::CapacityExceeded {
                    requested: capacity,
                    max: self.max_capacity,
                }
            })?;
            tracing::debug!(queue = %self.queue, excess, "waiting for slots to shrink pool");
            let retired = self
                .slots
                .acquire_many(excess)
                .await
                .map_err(|_| PoolError::Closed)?;
            retired.forget();
        }

        self.capacity.store(capacity, Ordering::Release);
        tracing::info!(queue = %self.queue, from = current, to = capacity, "worker pool resized");
        let _ = self.events.send(JobEvent::PoolResized {
            queue: self.queue.clone(),
            old_capacity: current,
            new_capacity: capacity,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Stop handing out slots and wait up to `drain` for running jobs.
    ///
    /// Jobs still running when the window closes keep running, but the
    /// pool no longer tracks them.
    pub async fn close(&self, drain: Duration) -> DrainOutcome {
        if self.state.send_replace(PoolState::Closing) == PoolState::Closing {
            return DrainOutcome::AlreadyClosed;
        }
        self.slots.close();

        let mut in_flight = self.in_flight.subscribe();
        let drained = tokio::time::timeout(drain, in_flight.wait_for(|n| *n == 0))
            .await
            .is_ok();

        if drained {
            tracing::info!(queue = %self.queue, "worker pool drained");
            DrainOutcome::Drained
        } else {
            let abandoned = *in_flight.borrow();
            tracing::warn!(
                queue = %self.queue,
                abandoned,
                "drain window elapsed, abandoning running jobs"
            );
            DrainOutcome::TimedOut { abandoned }
        }
    }

    async fn execute(&self, mut job: Job) {
        if let Err(e) = job.verify_integrity() {
            tracing::error!(error = %e, "job payload failed integrity check");
            self.fail(&mut job, FailureKind::Corrupted, e.to_string());
            return;
        }

        let now = Utc::now();
        if let Err(e) = job.check_expiry(now) {
            tracing::warn!(error = %e, "job expired before it could run");
            self.fail(&mut job, FailureKind::Expired, e.to_string());
            return;
        }

        job.mark_started(now);
        let _ = self.events.send(JobEvent::JobStarted {
            job_id: job.id,
            queue: self.queue.clone(),
            attempt: job.attempts,
            timestamp: now,
        });

        let rebuilt = {
            let registry = self.registry.read().await;
            registry.reconstruct(&job.payload_type, &job.payload)
        };
        let runner = match rebuilt {
            Ok(runner) => runner,
            Err(e) => {
                let kind = match e {
                    RegistryError::NotFound(_) => FailureKind::NotRegistered,
                    RegistryError::Decode { .. } => FailureKind::Undecodable,
                };
                tracing::error!(error = %e, "cannot rebuild job from payload");
                self.fail(&mut job, kind, e.to_string());
                return;
            }
        };

        let started = Instant::now();
        let run = AssertUnwindSafe(async { runner.run().await }).catch_unwind();
        let outcome = if job.max_run_time.is_zero() {
            Some(run.await)
        } else {
            tokio::time::timeout(job.max_run_time, run).await.ok()
        };

        match outcome {
            Some(Ok(Ok(()))) => {
                let now = Utc::now();
                job.mark_finished(now);
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::info!(duration_ms, "job finished");
                let _ = self.events.send(JobEvent::JobFinished {
                    job_id: job.id,
                    queue: self.queue.clone(),
                    duration_ms,
                    timestamp: now,
                });
            }
            Some(Ok(Err(e))) => {
                tracing::error!(error = %e, job = ?job, "job failed");
                self.fail(&mut job, FailureKind::Run, e.to_string());
            }
            Some(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(panic = %message, job = ?job, "job panicked");
                self.fail(&mut job, FailureKind::Panicked, message);
            }
            None => {
                let message = format!("job exceeded max run time of {:?}", job.max_run_time);
                tracing::error!(job = ?job, "{}", message);
                self.fail(&mut job, FailureKind::TimedOut, message);
            }
        }
    }

    fn fail(&self, job: &mut Job, kind: FailureKind, error: String) {
        let now = Utc::now();
        if job.failed_at.is_none() {
            job.mark_failed(now, error.clone());
        }
        let _ = self.events.send(JobEvent::JobFailed {
            job_id: job.id,
            queue: self.queue.clone(),
            kind,
            error,
            attempts: job.attempts,
            timestamp: now,
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use shigoto_core::JobOptions;

    use super::*;
    use crate::registry::JobRegistry;
    use crate::task::{RunFuture, Runner, Task};

    #[derive(Serialize, Deserialize)]
    struct Explode;

    impl Runner for Explode {
        fn run(&self) -> RunFuture<'_> {
            Box::pin(async { panic!("boom") })
        }
    }

    impl Task for Explode {
        fn identify() -> Option<&'static str> {
            Some("explode")
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Sleepy {
        millis: u64,
    }

    impl Runner for Sleepy {
        fn run(&self) -> RunFuture<'_> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(self.millis)).await;
                Ok(())
            })
        }
    }

    impl Task for Sleepy {
        fn identify() -> Option<&'static str> {
            Some("sleepy")
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Grumpy;

    impl Runner for Grumpy {
        fn run(&self) -> RunFuture<'_> {
            Box::pin(async { Err("nope".into()) })
        }
    }

    impl Task for Grumpy {
        fn identify() -> Option<&'static str> {
            Some("grumpy")
        }
    }

    fn pool(capacity: usize) -> (Arc<WorkerPool>, broadcast::Receiver<JobEvent>) {
        let mut registry = JobRegistry::new();
        registry.register_task::<Explode>();
        registry.register_task::<Sleepy>();
        registry.register_task::<Grumpy>();
        let (events, rx) = broadcast::channel(64);
        let pool = WorkerPool::new("test", capacity, 8, registry.shared(), events).unwrap();
        (pool, rx)
    }

    async fn next_failure(rx: &mut broadcast::Receiver<JobEvent>) -> FailureKind {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let JobEvent::JobFailed { kind, .. } = event {
                return kind;
            }
        }
    }

    async fn next_failed_event(rx: &mut broadcast::Receiver<JobEvent>) -> (FailureKind, String, u32) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let JobEvent::JobFailed {
                kind,
                error,
                attempts,
                ..
            } = event
            {
                return (kind, error, attempts);
            }
        }
    }

    async fn settle(pool: &WorkerPool, available: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while pool.available() != available {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn panicking_job_returns_its_slot() {
        let (pool, mut rx) = pool(1);
        let slot = pool.acquire().await.unwrap();
        let handle = pool.dispatch(slot, Job::new(b"null".to_vec(), "explode", "test"));
        handle.await.unwrap();

        assert_eq!(next_failure(&mut rx).await, FailureKind::Panicked);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn unregistered_type_fails_without_losing_the_slot() {
        let (pool, mut rx) = pool(1);
        let slot = pool.acquire().await.unwrap();
        pool.dispatch(slot, Job::new(b"{}".to_vec(), "ghost", "test"));

        assert_eq!(next_failure(&mut rx).await, FailureKind::NotRegistered);
        settle(&pool, 1).await;
    }

    #[tokio::test]
    async fn run_error_fails_the_job_after_counting_the_attempt() {
        let (pool, mut rx) = pool(1);
        let slot = pool.acquire().await.unwrap();
        pool.dispatch(slot, Job::new(b"null".to_vec(), "grumpy", "test"))
            .await
            .unwrap();

        let (kind, error, attempts) = next_failed_event(&mut rx).await;
        assert_eq!(kind, FailureKind::Run);
        assert_eq!(error, "nope");
        assert_eq!(attempts, 1);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn undecodable_payload_fails_without_running() {
        let (pool, mut rx) = pool(1);
        let slot = pool.acquire().await.unwrap();
        pool.dispatch(slot, Job::new(br#"{"millis":"soon"}"#.to_vec(), "sleepy", "test"))
            .await
            .unwrap();

        let (kind, _, attempts) = next_failed_event(&mut rx).await;
        assert_eq!(kind, FailureKind::Undecodable);
        assert_eq!(attempts, 1);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn max_run_time_times_out_the_run() {
        let (pool, mut rx) = pool(1);
        let job = Job::new(br#"{"millis":5000}"#.to_vec(), "sleepy", "test").with_options(
            JobOptions::default().with_max_run_time(Duration::from_millis(20)),
        );
        let slot = pool.acquire().await.unwrap();
        pool.dispatch(slot, job);

        assert_eq!(next_failure(&mut rx).await, FailureKind::TimedOut);
        settle(&pool, 1).await;
    }

    #[tokio::test]
    async fn shrink_waits_for_running_jobs() {
        let (pool, _rx) = pool(3);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let _c = pool.acquire().await.unwrap();

        let resize = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.resize(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!resize.is_finished());
        assert_eq!(pool.capacity(), 3);

        drop(a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!resize.is_finished());

        drop(b);
        tokio::time::timeout(Duration::from_secs(1), resize)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.in_flight(), 1);
    }

    #[tokio::test]
    async fn grow_adds_slots_immediately() {
        let (pool, _rx) = pool(1);
        let _held = pool.acquire().await.unwrap();

        pool.resize(4).await.unwrap();

        let mut extra = Vec::new();
        for _ in 0..3 {
            let slot = tokio::time::timeout(Duration::from_millis(50), pool.acquire())
                .await
                .expect("acquire should not block")
                .unwrap();
            extra.push(slot);
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(20), pool.acquire())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn resize_above_ceiling_is_rejected() {
        let (pool, _rx) = pool(2);
        assert!(matches!(
            pool.resize(9).await,
            Err(PoolError::CapacityExceeded { requested: 9, max: 8 })
        ));
        assert_eq!(pool.capacity(), 2);
        assert!(pool.resize(2).await.is_ok());
    }

    #[tokio::test]
    async fn close_drains_then_refuses_work() {
        let (pool, _rx) = pool(2);
        let slot = pool.acquire().await.unwrap();
        pool.dispatch(slot, Job::new(br#"{"millis":30}"#.to_vec(), "sleepy", "test"));

        let outcome = pool.close(Duration::from_secs(2)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
        assert_eq!(pool.state(), PoolState::Closing);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
        assert_eq!(pool.close(Duration::from_secs(1)).await, DrainOutcome::AlreadyClosed);
    }

    #[tokio::test]
    async fn close_gives_up_after_the_drain_window() {
        let (pool, _rx) = pool(1);
        let _stuck = pool.acquire().await.unwrap();

        let outcome = pool.close(Duration::from_millis(20)).await;
        assert_eq!(outcome, DrainOutcome::TimedOut { abandoned: 1 });
    }
}
