//! Future-like task handle
//!
//! A [`Task`] is shared between the caller, the pending queue and the
//! supervisor. State transitions happen under the task's own lock; the result
//! slot is a write-once cell published before the terminal state becomes
//! visible, so it can be read without locking once `done()` is true.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

use super::{Callback, TaskId, TaskPayload, TaskState};
use crate::error::{FunctionError, TaskError};
use crate::worker::WorkerId;

/// Observer notified by a task after it reaches a terminal state
///
/// Implemented by the pool so queue and registry bookkeeping follows
/// transitions made from caller threads (e.g. `cancel()`).
pub(crate) trait TaskHooks: Send + Sync {
    /// Called once, outside the task lock, after the terminal transition
    fn on_terminal(&self, task: &Task, previous: TaskState, worker: Option<WorkerId>);
}

struct TaskCore {
    state: TaskState,
    worker: Option<WorkerId>,
    started_at: Option<Instant>,
    callbacks: Vec<Callback>,
}

struct TaskInner {
    id: TaskId,
    payload: TaskPayload,
    timeout: Option<Duration>,
    scheduled_at: DateTime<Utc>,
    core: Mutex<TaskCore>,
    completed: Condvar,
    slot: OnceLock<Result<Value, TaskError>>,
    finished: watch::Sender<bool>,
    hooks: Option<Weak<dyn TaskHooks>>,
}

/// Handle to one submitted unit of work and its eventual outcome
///
/// Handles are cheap to clone; all clones observe the same task.
///
/// # Example
///
/// ```ignore
/// let task = pool.schedule(TaskPayload::new("add").arg(1).arg(1), ScheduleOptions::new())?;
///
/// match task.get(Some(Duration::from_secs(1))) {
///     Ok(value) => println!("result: {}", value),
///     Err(e) if e.is_timeout() => println!("still running or timed out"),
///     Err(e) => println!("failed: {}", e),
/// }
/// ```
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        payload: TaskPayload,
        timeout: Option<Duration>,
        callback: Option<Callback>,
        hooks: Option<Weak<dyn TaskHooks>>,
    ) -> Self {
        let (finished, _) = watch::channel(false);

        Self {
            inner: Arc::new(TaskInner {
                id,
                payload,
                timeout,
                scheduled_at: Utc::now(),
                core: Mutex::new(TaskCore {
                    state: TaskState::Created,
                    worker: None,
                    started_at: None,
                    callbacks: callback.into_iter().collect(),
                }),
                completed: Condvar::new(),
                slot: OnceLock::new(),
                finished,
                hooks,
            }),
        }
    }

    /// Task identifier
    pub fn id(&self) -> &TaskId {
        &self.inner.id
    }

    /// Payload this task executes
    pub fn payload(&self) -> &TaskPayload {
        &self.inner.payload
    }

    /// Execution deadline, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    /// When the task was scheduled
    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.inner.scheduled_at
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.inner.core.lock().state
    }

    /// Non-blocking check for a terminal state
    pub fn done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the task ended cancelled
    pub fn cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Worker currently executing the task
    pub fn worker(&self) -> Option<WorkerId> {
        self.inner.core.lock().worker
    }

    /// Outcome if the task is finished, without blocking
    pub fn result(&self) -> Option<Result<Value, TaskError>> {
        self.inner.slot.get().cloned()
    }

    /// Block until the task finishes or `timeout` elapses
    ///
    /// A caller-side timeout returns [`TaskError::WaitTimeout`] and leaves the
    /// task running; the task's own deadline returns [`TaskError::Timeout`].
    pub fn get(&self, timeout: Option<Duration>) -> Result<Value, TaskError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut core = self.inner.core.lock();

        while !core.state.is_terminal() {
            match deadline {
                None => self.inner.completed.wait(&mut core),
                Some(deadline) => {
                    let result = self.inner.completed.wait_until(&mut core, deadline);
                    if result.timed_out() && !core.state.is_terminal() {
                        return Err(TaskError::WaitTimeout {
                            waited: timeout.unwrap_or_default(),
                        });
                    }
                }
            }
        }
        drop(core);

        self.outcome()
    }

    /// Like [`get`](Self::get), decoding the value into `T`
    pub fn get_as<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<T, TaskError> {
        let value = self.get(timeout)?;
        serde_json::from_value(value).map_err(|e| TaskError::Decode(e.to_string()))
    }

    /// Wait asynchronously for the task to finish
    pub async fn wait(&self) -> Result<Value, TaskError> {
        let mut rx = self.inner.finished.subscribe();
        // The sender lives as long as the task, so this only returns once finished
        let _ = rx.wait_for(|finished| *finished).await;
        self.outcome()
    }

    /// Cancel the task
    ///
    /// Queued tasks are removed from the pending queue immediately. Running
    /// tasks are marked cancelled at once; the pool then terminates the owning
    /// process worker, or abandons a thread worker and discards its result.
    /// Returns `true` if this call cancelled the task, `false` if it had
    /// already finished.
    pub fn cancel(&self) -> bool {
        if self.done() {
            return false;
        }
        self.finish(Err(TaskError::Cancelled))
    }

    /// Register an observer called once when the task finishes
    ///
    /// Runs immediately on the calling thread if the task is already finished;
    /// otherwise where [`ScheduleOptions::with_callback`] callbacks run.
    ///
    /// [`ScheduleOptions::with_callback`]: crate::ScheduleOptions::with_callback
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        {
            let mut core = self.inner.core.lock();
            if !core.state.is_terminal() {
                core.callbacks.push(Box::new(callback));
                return;
            }
        }
        self.run_callbacks(vec![Box::new(callback)]);
    }

    /// Whether two handles refer to the same task
    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // =========================================================================
    // Transitions driven by the pool
    // =========================================================================

    /// Created -> Queued
    pub(crate) fn mark_queued(&self) -> bool {
        let mut core = self.inner.core.lock();
        if core.state != TaskState::Created {
            return false;
        }
        core.state = TaskState::Queued;
        true
    }

    /// Queued -> Running, bound to `worker`
    ///
    /// Fails if the task was cancelled while waiting in the queue.
    pub(crate) fn try_start(&self, worker: WorkerId) -> bool {
        let mut core = self.inner.core.lock();
        if core.state != TaskState::Queued {
            return false;
        }
        core.state = TaskState::Running;
        core.worker = Some(worker);
        core.started_at = Some(Instant::now());
        true
    }

    /// When the task started running
    pub(crate) fn started_at(&self) -> Option<Instant> {
        self.inner.core.lock().started_at
    }

    /// Move to the terminal state matching `result`, running callbacks inline
    ///
    /// Returns `false` (and discards `result`) if the task already finished.
    pub(crate) fn finish(&self, result: Result<Value, TaskError>) -> bool {
        match self.complete(result) {
            Some(callbacks) => {
                self.run_callbacks(callbacks);
                true
            }
            None => false,
        }
    }

    /// Terminal transition without running callbacks
    ///
    /// Returns the callbacks the caller must run (or hand off), or `None` if
    /// the task already finished.
    pub(crate) fn complete(&self, result: Result<Value, TaskError>) -> Option<Vec<Callback>> {
        let next = terminal_state_for(&result);

        let (previous, worker, callbacks) = {
            let mut core = self.inner.core.lock();
            if core.state.is_terminal() {
                return None;
            }
            debug_assert!(core.state.can_transition_to(next));

            let previous = core.state;
            // Slot is published before the state flips, under the same lock
            let _ = self.inner.slot.set(result);
            core.state = next;
            (
                previous,
                core.worker.take(),
                std::mem::take(&mut core.callbacks),
            )
        };

        self.inner.completed.notify_all();
        self.inner.finished.send_replace(true);

        if let Some(hooks) = self.inner.hooks.as_ref().and_then(Weak::upgrade) {
            hooks.on_terminal(self, previous, worker);
        }

        Some(callbacks)
    }

    fn outcome(&self) -> Result<Value, TaskError> {
        self.inner
            .slot
            .get()
            .cloned()
            .unwrap_or_else(|| Err(TaskError::PoolFailure("task result missing".to_string())))
    }

    pub(crate) fn run_callbacks(&self, callbacks: Vec<Callback>) {
        for callback in callbacks {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(self))) {
                warn!(
                    task_id = %self.inner.id,
                    error = %FunctionError::from_panic(panic),
                    "Task callback panicked"
                );
            }
        }
    }
}

fn terminal_state_for(result: &Result<Value, TaskError>) -> TaskState {
    match result {
        Ok(_) => TaskState::Done,
        Err(TaskError::Timeout { .. }) => TaskState::TimedOut,
        Err(TaskError::Cancelled) => TaskState::Cancelled,
        Err(_) => TaskState::Failed,
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("function", &self.inner.payload.function)
            .field("state", &self.state())
            .finish()
    }
}
