//! The pool: scheduling façade, pending queue and supervisor
//!
//! Callers talk to a [`Pool`] from any thread. All worker and dispatch state
//! is owned by one supervisor loop running on a dedicated thread; callers
//! reach it through the pending queue and a command channel only.

mod controller;
mod map;
mod notifier;
mod queue;
mod shared;
mod supervisor;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use controller::Pool;
pub use map::{MapOptions, MapResults};

/// Pool lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Workers are being started
    Created,
    /// Accepting submissions
    Running,
    /// Not accepting submissions; queued and running tasks complete
    Closing,
    /// Not accepting submissions; queued tasks were cancelled
    Stopping,
    /// Supervisor finished, all workers reaped
    Stopped,
    /// Unrecoverable failure; all submissions fail
    Failed,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Closing => write!(f, "closing"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// How a pool stops; later variants are stricter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Queued and running tasks complete, then workers exit
    Drain,
    /// Running tasks complete; queued tasks are cancelled
    Graceful,
    /// Running tasks are cancelled and their workers terminated (process)
    /// or abandoned (thread); queued tasks are cancelled
    Immediate,
}

/// Point-in-time snapshot of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub status: PoolStatus,
    /// Live workers (starting, idle or busy)
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    /// Tasks waiting in the pending queue
    pub pending: usize,
    /// Tasks scheduled and not yet finished
    pub active_tasks: usize,
    /// Tasks whose result came back from a worker
    pub completed: u64,
    pub timed_out: u64,
    /// Tasks lost to a worker dying mid-execution
    pub expired: u64,
}
