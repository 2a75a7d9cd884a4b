//! Task identity and lifecycle state

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a task, unique among the live tasks of a pool
///
/// Caller-supplied identifiers are used verbatim; generated identifiers are
/// UUID v7 strings so they sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create an identifier from a caller-supplied value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Borrow the identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Task lifecycle state
///
/// ```text
/// Created ──► Queued ──► Running ──► Done | Failed | TimedOut | Cancelled
///               │
///               └──────────────────► Cancelled
/// ```
///
/// Transitions are monotonic: a terminal state is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created but not yet admitted to the pending queue
    Created,
    /// Waiting in the pending queue for an idle worker
    Queued,
    /// Bound to exactly one worker
    Running,
    /// Completed with a value
    Done,
    /// Completed with an application error, worker expiry or pool failure
    Failed,
    /// Deadline elapsed while running
    TimedOut,
    /// Cancelled before completion
    Cancelled,
}

impl TaskState {
    /// Whether this state is final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match (self, next) {
            (Self::Created, Self::Queued) => true,
            (Self::Created | Self::Queued, Self::Cancelled) => true,
            (Self::Queued, Self::Running) => true,
            // Shutdown and pool failures resolve tasks that never ran
            (Self::Created | Self::Queued, Self::Failed) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
