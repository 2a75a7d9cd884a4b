//! Task model: identity, state machine, payloads and the shared handle

mod handle;
mod payload;
mod state;

pub(crate) use handle::TaskHooks;
pub use handle::Task;
pub use payload::{Callback, ScheduleOptions, TaskPayload};
pub use state::{TaskId, TaskState};
