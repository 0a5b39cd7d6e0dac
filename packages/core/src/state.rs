//! State enums shared by listeners and worker pools.

use serde::{Deserialize, Serialize};

/// Intake state of a queue listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    #[default]
    Initializing,
    /// Actively pulling records from the TaskBoard.
    Listening,
    Pausing,
    /// Not pulling; waiting for a resume or stop signal.
    Paused,
    Resuming,
    Stopping,
    /// Terminal.
    Stopped,
}

impl ListenerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ListenerState::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Initializing => "initializing",
            ListenerState::Listening => "listening",
            ListenerState::Pausing => "pausing",
            ListenerState::Paused => "paused",
            ListenerState::Resuming => "resuming",
            ListenerState::Stopping => "stopping",
            ListenerState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    #[default]
    Initializing,
    Running,
    /// No new acquisitions; in-flight work is draining or has been abandoned.
    Closing,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Initializing => write!(f, "initializing"),
            PoolState::Running => write!(f, "running"),
            PoolState::Closing => write!(f, "closing"),
        }
    }
}

/// How a pause signal interacts with a TaskBoard read that is already waiting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PausePolicy {
    /// Abandon the pending read and pause at once.
    #[default]
    Immediate,
    /// Let the pending read return and dispatch its record, then pause.
    AfterRead,
}

impl std::str::FromStr for PausePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(PausePolicy::Immediate),
            "after_read" | "after-read" => Ok(PausePolicy::AfterRead),
            other => Err(format!("unknown pause policy '{other}'")),
        }
    }
}
