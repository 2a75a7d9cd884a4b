//! Workers: isolated execution contexts running one task at a time
//!
//! Two variants sit behind the [`Worker`] trait:
//! - [`ThreadWorker`]: a dedicated OS thread sharing the pool's registry.
//!   It cannot be forcibly stopped; `terminate()` reports
//!   [`Termination::Unsupported`] and the supervisor abandons it instead.
//! - `ProcessWorker` (Unix): a child process connected over a Unix socket.
//!   `terminate()` kills it.
//!
//! Workers report back through a shared event channel so the supervisor can
//! wait on all of them at once.

mod runner;
mod thread;

#[cfg(unix)]
pub mod bootstrap;
#[cfg(unix)]
mod command;
#[cfg(unix)]
mod process;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::channel::{ChannelError, Request, Response};
use crate::error::{ExitInfo, FunctionError};
use crate::function::Outcome;
use crate::task::TaskId;

pub(crate) use runner::{Runner, Step};
pub use thread::{ThreadWorker, ThreadWorkerFactory};

#[cfg(unix)]
pub use command::WorkerCommand;
#[cfg(unix)]
pub use process::{ProcessWorker, ProcessWorkerFactory};

/// Identifier of a worker, unique within one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Isolation boundary of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Thread,
    Process,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Result of asking a worker to stop immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The underlying process was killed
    Terminated,
    /// The worker cannot be interrupted mid-execution
    Unsupported,
}

/// Notification from a worker to the supervisor
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker: WorkerId,
    pub kind: WorkerEventKind,
}

#[derive(Debug)]
pub enum WorkerEventKind {
    /// Initializer finished; the worker accepts tasks
    Ready,
    /// Initializer failed
    InitFailed(FunctionError),
    /// A task finished
    Completed { task: TaskId, outcome: Outcome },
    /// The worker's channel closed; no further events follow
    Disconnected,
}

impl WorkerEvent {
    pub(crate) fn disconnected(worker: WorkerId) -> Self {
        Self {
            worker,
            kind: WorkerEventKind::Disconnected,
        }
    }

    pub(crate) fn from_response(worker: WorkerId, response: Response) -> Self {
        let kind = match response {
            Response::Ready => WorkerEventKind::Ready,
            Response::InitFailed { error } => WorkerEventKind::InitFailed(error),
            Response::Completed { task, outcome } => WorkerEventKind::Completed { task, outcome },
        };
        Self { worker, kind }
    }
}

/// One execution context owned by the supervisor
#[async_trait]
pub trait Worker: Send {
    fn id(&self) -> WorkerId;

    fn kind(&self) -> WorkerKind;

    /// OS process id, for process workers
    fn pid(&self) -> Option<u32>;

    /// Queue a request for the worker
    fn send(&mut self, request: Request) -> Result<(), ChannelError>;

    /// Exit status, once the worker is gone and its channel is drained
    fn poll_exit(&mut self) -> Option<ExitInfo>;

    /// Stop the worker immediately, if the variant supports it
    fn terminate(&mut self) -> Termination;

    /// Wait up to `grace` for the worker to exit and release its resources
    async fn reap(&mut self, grace: Duration) -> ExitInfo;
}

/// Creates workers for a pool
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    fn kind(&self) -> WorkerKind;

    /// Start a worker that reports to `events`
    ///
    /// The worker is not usable until it has been sent [`Request::Init`] and
    /// answered with [`WorkerEventKind::Ready`]. Replacement spawns run as
    /// background tasks on the supervisor's runtime, several at a time, so the
    /// future must await rather than block.
    async fn spawn(
        &self,
        id: WorkerId,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn Worker>, SpawnError>;
}

/// Worker could not be started
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker did not connect within {0:?}")]
    Timeout(Duration),

    #[error("worker exited during startup ({0})")]
    ExitedEarly(ExitInfo),

    #[error("{0}")]
    Unsupported(String),
}
