#![allow(dead_code)]

use std::error::Error;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shigoto::{JobEvent, JobOptions, ListenerState, RunFuture, Runner, Shigoto, Task};
use tokio::sync::{Mutex, MutexGuard, broadcast};

/// Total amount added by every `Tally` and `Ephemeral` run in this process.
pub static RUNS: AtomicUsize = AtomicUsize::new(0);

static TEST_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Serialize tests that observe `RUNS` and reset it.
pub async fn setup() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().await;
    RUNS.store(0, Ordering::SeqCst);
    guard
}

pub fn runs() -> usize {
    RUNS.load(Ordering::SeqCst)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Tally {
    pub amount: usize,
}

impl Runner for Tally {
    fn run(&self) -> RunFuture<'_> {
        Box::pin(async move {
            RUNS.fetch_add(self.amount, Ordering::SeqCst);
            Ok(())
        })
    }
}

impl Task for Tally {
    fn identify() -> Option<&'static str> {
        Some("tally")
    }
}

/// Expires one millisecond after it is queued.
#[derive(Debug, Serialize, Deserialize)]
pub struct Ephemeral;

impl Runner for Ephemeral {
    fn run(&self) -> RunFuture<'_> {
        Box::pin(async {
            RUNS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

impl Task for Ephemeral {
    fn default_queue(&self) -> Option<&str> {
        Some("ephemeral")
    }

    fn job_options(&self) -> JobOptions {
        JobOptions::default().with_expire_after(Duration::from_millis(1))
    }
}

/// Wait for the first event accepted by `matches`.
pub async fn next_event<F>(
    rx: &mut broadcast::Receiver<JobEvent>,
    mut matches: F,
) -> Result<JobEvent, Box<dyn Error>>
where
    F: FnMut(&JobEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await?;
            if matches(&event) {
                return Ok::<_, Box<dyn Error>>(event);
            }
        }
    })
    .await?
}

/// Poll the orchestrator until `queue`'s listener reports `state`.
pub async fn wait_for_state(
    shigoto: &Shigoto,
    queue: &str,
    state: ListenerState,
) -> Result<(), Box<dyn Error>> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while shigoto.listener_state(queue).await? != Some(state) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, Box<dyn Error>>(())
    })
    .await?
}
