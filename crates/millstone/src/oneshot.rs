//! Run a single function call in a dedicated, single-use worker
//!
//! Useful for one-off calls that need a hard deadline or crash isolation
//! without keeping a pool around. The worker is reaped in the background
//! once the call finishes.

use std::time::Duration;

use tracing::debug;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::function::FunctionRegistry;
use crate::pool::Pool;
use crate::task::{ScheduleOptions, Task, TaskPayload};

#[cfg(unix)]
use crate::worker::WorkerCommand;

/// Run `payload` on a fresh thread
///
/// On timeout the task ends TIMED_OUT and the thread is abandoned.
pub fn thread(
    registry: FunctionRegistry,
    payload: TaskPayload,
    timeout: Option<Duration>,
) -> Result<Task, PoolError> {
    let pool = Pool::thread(single_use(), registry)?;
    launch(pool, payload, timeout)
}

/// Run `payload` in a fresh child process
///
/// On timeout the process is killed and the task ends TIMED_OUT.
#[cfg(unix)]
pub fn process(
    registry: FunctionRegistry,
    command: WorkerCommand,
    payload: TaskPayload,
    timeout: Option<Duration>,
) -> Result<Task, PoolError> {
    let pool = Pool::process(single_use(), registry, command)?;
    launch(pool, payload, timeout)
}

fn single_use() -> PoolConfig {
    PoolConfig::new(1).with_max_tasks_per_worker(1)
}

fn launch(pool: Pool, payload: TaskPayload, timeout: Option<Duration>) -> Result<Task, PoolError> {
    let task = pool.schedule(payload, ScheduleOptions::new().with_optional_timeout(timeout))?;
    pool.close();

    // Dropping a closed pool waits for the task and reaps the worker
    std::thread::Builder::new()
        .name("millstone-oneshot".to_string())
        .spawn(move || {
            drop(pool);
            debug!("One-shot worker reaped");
        })?;

    Ok(task)
}
