//! Messages exchanged between the pool controller and a worker

use serde::{Deserialize, Serialize};

use crate::error::FunctionError;
use crate::function::Outcome;
use crate::task::{TaskId, TaskPayload};

/// Controller -> worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// First message on a fresh channel
    Init {
        /// Tasks to run before exiting for rotation (0 = unlimited)
        max_tasks: usize,
        /// Optional routine run once before the first task
        initializer: Option<TaskPayload>,
    },
    /// Run one task
    Execute { task: TaskId, payload: TaskPayload },
    /// Exit after the current task
    Shutdown,
}

/// Worker -> controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Initializer finished, worker accepts tasks
    Ready,
    /// Initializer failed; the worker exits
    InitFailed { error: FunctionError },
    /// A task finished
    Completed { task: TaskId, outcome: Outcome },
}
