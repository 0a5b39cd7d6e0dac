//! Capabilities a job type provides to the dispatch pipeline.

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde::de::DeserializeOwned;
use shigoto_core::JobOptions;

/// Error returned by a job's own logic.
pub type RunError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for job runs.
pub type RunResult = Result<(), RunError>;

/// Future type for async job runs.
pub type RunFuture<'a> = Pin<Box<dyn Future<Output = RunResult> + Send + 'a>>;

/// Something a worker can execute.
pub trait Runner: Send + Sync + 'static {
    /// Execute the job's work.
    fn run(&self) -> RunFuture<'_>;
}

/// A job type that can be queued by producers and rebuilt by workers.
///
/// Only `run` is required. The remaining methods are optional capabilities
/// with fallbacks:
/// - `identify` names the payload type tag; defaults to the Rust type name.
/// - `default_queue` picks the queue used by `Shigoto::queue`.
/// - `to_payload`/`from_payload` override the JSON payload encoding, for
///   types whose private state needs a custom wire form.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail { to: String }
///
/// impl Runner for SendEmail {
///     fn run(&self) -> RunFuture<'_> {
///         Box::pin(async move { mailer::send(&self.to).await })
///     }
/// }
///
/// impl Task for SendEmail {
///     fn identify() -> Option<&'static str> { Some("send_email") }
/// }
/// ```
pub trait Task: Runner + Serialize + DeserializeOwned + Sized {
    fn identify() -> Option<&'static str> {
        None
    }

    fn default_queue(&self) -> Option<&str> {
        None
    }

    /// Limits stamped onto the job when it is queued.
    fn job_options(&self) -> JobOptions {
        JobOptions::default()
    }

    fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Build a fresh instance from a payload written by `to_payload`.
    fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// The payload type tag under which `T` is registered and queued.
pub fn task_tag<T: Task>() -> String {
    T::identify()
        .map(str::to_string)
        .unwrap_or_else(|| std::any::type_name::<T>().to_string())
}
