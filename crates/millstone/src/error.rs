//! Error types for pool, task and function failures
//!
//! Three layers keep "my code failed" apart from "the execution environment failed":
//! - [`FunctionError`] is what a registered function returns; it crosses the
//!   worker boundary verbatim.
//! - [`TaskError`] is what a [`Task`](crate::Task) resolves to when it does not succeed.
//! - [`PoolError`] is returned by pool entry points (`schedule`, `join`, ...).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::PoolStatus;
use crate::task::TaskId;
use crate::worker::WorkerId;

/// Error raised by a registered function
///
/// # Example
///
/// ```
/// use millstone::FunctionError;
///
/// let error = FunctionError::new("division by zero").with_kind("ZeroDivisionError");
/// assert_eq!(error.kind.as_deref(), Some("ZeroDivisionError"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub kind: Option<String>,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl FunctionError {
    /// Kind used for panics caught inside a worker
    pub const PANIC: &'static str = "panic";

    /// Kind used when the payload names a function the worker does not know
    pub const UNKNOWN_FUNCTION: &'static str = "unknown_function";

    /// Kind used when arguments cannot be decoded into the expected types
    pub const INVALID_ARGUMENTS: &'static str = "invalid_arguments";

    /// Create a new error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            details: None,
        }
    }

    /// Set the error kind
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Build an error from a caught panic payload
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "function panicked".to_string()
        };

        Self::new(message).with_kind(Self::PANIC)
    }

    /// Whether this error was produced by a panic
    pub fn is_panic(&self) -> bool {
        self.kind.as_deref() == Some(Self::PANIC)
    }
}

impl fmt::Display for FunctionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Some(kind) => write!(f, "{}: {}", kind, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for FunctionError {}

impl From<anyhow::Error> for FunctionError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for FunctionError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_kind(Self::INVALID_ARGUMENTS)
    }
}

/// How a worker's underlying thread or process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "value")]
pub enum ExitInfo {
    /// Clean exit (exit code 0, or a thread that returned)
    Success,
    /// Non-zero exit code
    Code(i32),
    /// Killed by a signal
    Signal(i32),
    /// Thread ended by an unwinding panic
    Panicked,
    /// Exit status could not be observed
    Unknown,
}

impl ExitInfo {
    /// Whether the exit was clean
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        if status.success() {
            return Self::Success;
        }

        if let Some(code) = status.code() {
            return Self::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }

        Self::Unknown
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "clean exit"),
            Self::Code(code) => write!(f, "exit code {}", code),
            Self::Signal(signal) => write!(f, "signal {}", signal),
            Self::Panicked => write!(f, "panicked"),
            Self::Unknown => write!(f, "unknown exit status"),
        }
    }
}

/// Details of a worker that died while executing a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerExpired {
    /// Worker that died
    pub worker: WorkerId,
    /// OS process id (process workers only)
    pub pid: Option<u32>,
    /// How the worker ended
    pub exit: ExitInfo,
}

impl fmt::Display for WorkerExpired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} (pid {}) terminated: {}", self.worker, pid, self.exit),
            None => write!(f, "{} terminated: {}", self.worker, self.exit),
        }
    }
}

/// Terminal failure of a task, returned from [`Task::get`](crate::Task::get)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "error", content = "detail")]
pub enum TaskError {
    /// The function returned an error or panicked
    #[error("task failed: {0}")]
    Application(FunctionError),

    /// The task's own deadline elapsed; the task is permanently TIMED_OUT
    #[error("task timed out after {limit:?}")]
    Timeout { limit: Duration },

    /// The caller's `get` timeout elapsed; the task itself keeps running
    #[error("no result after waiting {waited:?}")]
    WaitTimeout { waited: Duration },

    /// The worker executing the task died before the task finished
    #[error("worker expired: {0}")]
    WorkerExpired(WorkerExpired),

    /// The task was cancelled before it completed
    #[error("task was cancelled")]
    Cancelled,

    /// The pool failed and could not run the task
    #[error("pool failure: {0}")]
    PoolFailure(String),

    /// The result could not be decoded into the requested type
    #[error("failed to decode task result: {0}")]
    Decode(String),
}

impl TaskError {
    /// True for both the task deadline and the caller-side wait timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::WaitTimeout { .. })
    }

    /// True when the task was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True when the executing worker died
    pub fn is_worker_expired(&self) -> bool {
        matches!(self, Self::WorkerExpired(_))
    }

    /// The function error, if the task failed inside user code
    pub fn application(&self) -> Option<&FunctionError> {
        match self {
            Self::Application(error) => Some(error),
            _ => None,
        }
    }
}

/// Errors returned by pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Pool does not accept submissions in its current state
    #[error("pool is not running (status: {0})")]
    NotRunning(PoolStatus),

    /// Pool hit an unrecoverable internal failure
    #[error("pool failed: {0}")]
    Failed(String),

    /// Bounded pending queue is full
    #[error("pending queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// No function registered under this name
    #[error("no function registered under name: {0}")]
    UnknownFunction(String),

    /// Payload could not be serialized for transport
    #[error("payload serialization failed: {0}")]
    Serialization(String),

    /// A live task already uses this identifier
    #[error("duplicate task identifier: {0}")]
    DuplicateTask(TaskId),

    /// Invalid configuration or argument
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A worker could not be spawned
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] crate::worker::SpawnError),

    /// `join` called before `close`/`stop`
    #[error("pool is still running; call close() or stop() before join()")]
    StillRunning,

    /// `join` timed out
    #[error("timed out waiting for the pool to stop")]
    JoinTimeout,

    /// `join` called from one of the pool's own completion callbacks
    #[error("cannot join a pool from its own completion callback")]
    JoinFromCallback,

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
