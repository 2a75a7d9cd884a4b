//! Millstone: worker-pool task execution
//!
//! Callers submit units of work (a registered function plus arguments) to a
//! pool of worker threads or processes and get back a [`Task`] handle that
//! yields the result, the function's error, or a timeout/cancellation/worker
//! expiry error.
//!
//! # Architecture
//!
//! - **Function registry**: functions are called by registered name so they
//!   can cross a process boundary; arguments and results are JSON values.
//! - **Task**: future-like handle with a write-once result slot, blocking
//!   and async waits, cancellation and completion callbacks.
//! - **Channel**: length-delimited frames carrying [`channel::Request`] and
//!   [`channel::Response`] messages through a pluggable [`channel::Codec`].
//! - **Workers**: threads (cannot be interrupted; abandoned on timeout) or
//!   child processes (killed on timeout), behind one [`worker::Worker`] trait.
//! - **Supervisor**: one control loop that dispatches queued tasks, enforces
//!   deadlines, detects dead workers and keeps the pool at size.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use millstone::prelude::*;
//!
//! let registry = FunctionRegistry::new().with("add", |args: Args| {
//!     Ok::<_, FunctionError>(args.get::<i64>(0)? + args.get::<i64>(1)?)
//! });
//!
//! let pool = Pool::thread(PoolConfig::new(4), registry)?;
//! let task = pool.schedule(
//!     TaskPayload::new("add").arg(1).arg(2),
//!     ScheduleOptions::new().with_timeout(Duration::from_secs(1)),
//! )?;
//! assert_eq!(task.get_as::<i64>(None)?, 3);
//! ```
//!
//! Process pools re-execute a binary that calls
//! [`worker::bootstrap::run_if_worker`] first thing in `main`.

pub mod channel;
pub mod config;
pub mod error;
pub mod function;
pub mod oneshot;
pub mod pool;
pub mod task;
pub mod telemetry;
pub mod worker;

pub use config::PoolConfig;
pub use error::{ExitInfo, FunctionError, PoolError, TaskError, WorkerExpired};
pub use function::{Args, FunctionRegistry};
pub use pool::{MapOptions, MapResults, Pool, PoolStats, PoolStatus, ShutdownMode};
pub use task::{ScheduleOptions, Task, TaskId, TaskPayload, TaskState};
pub use worker::{WorkerId, WorkerKind};

#[cfg(unix)]
pub use worker::WorkerCommand;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::PoolConfig;
    pub use crate::error::{FunctionError, PoolError, TaskError};
    pub use crate::function::{Args, FunctionRegistry};
    pub use crate::pool::{MapOptions, Pool, ShutdownMode};
    pub use crate::task::{ScheduleOptions, Task, TaskPayload, TaskState};
    #[cfg(unix)]
    pub use crate::worker::WorkerCommand;
}
