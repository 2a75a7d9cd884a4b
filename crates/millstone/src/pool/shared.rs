//! State shared between the pool façade, task handles and the supervisor

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tracing::debug;

use super::queue::TaskQueue;
use super::{PoolStatus, ShutdownMode};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::function::FunctionRegistry;
use crate::task::{Task, TaskHooks, TaskId, TaskState};
use crate::worker::{WorkerId, WorkerKind};

/// Requests from caller threads to the supervisor
#[derive(Debug)]
pub(crate) enum Command {
    /// A RUNNING task was cancelled; reclaim its worker
    Cancel { task: TaskId, worker: WorkerId },
    /// Begin (or escalate) shutdown
    Shutdown(ShutdownMode),
}

/// Worker-side counters published by the supervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WorkerCounts {
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    pub completed: u64,
    pub timed_out: u64,
    pub expired: u64,
}

struct PoolState {
    status: PoolStatus,
    failure: Option<String>,
}

/// Owned registry of everything a pool instance shares across threads
///
/// Lock order: a task's own lock is never held while taking any lock here.
pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    pub(crate) registry: Arc<FunctionRegistry>,
    pub(crate) kind: WorkerKind,
    pub(crate) queue: TaskQueue,
    pub(crate) wakeup: Notify,
    state: RwLock<PoolState>,
    tasks: Mutex<HashMap<TaskId, Task>>,
    commands: UnboundedSender<Command>,
    counts: Mutex<WorkerCounts>,
    terminated: Mutex<bool>,
    terminated_cv: Condvar,
    callback_thread: OnceLock<ThreadId>,
}

impl PoolShared {
    pub(crate) fn new(
        config: PoolConfig,
        registry: Arc<FunctionRegistry>,
        kind: WorkerKind,
    ) -> (Arc<Self>, UnboundedReceiver<Command>) {
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Self {
            queue: TaskQueue::new(config.max_queue_size),
            config,
            registry,
            kind,
            wakeup: Notify::new(),
            state: RwLock::new(PoolState {
                status: PoolStatus::Created,
                failure: None,
            }),
            tasks: Mutex::new(HashMap::new()),
            commands,
            counts: Mutex::new(WorkerCounts::default()),
            terminated: Mutex::new(false),
            terminated_cv: Condvar::new(),
            callback_thread: OnceLock::new(),
        });

        (shared, commands_rx)
    }

    /// Observer handle given to every task of this pool
    pub(crate) fn hooks(self: &Arc<Self>) -> Weak<dyn TaskHooks> {
        let weak: Weak<PoolShared> = Arc::downgrade(self);
        weak
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub(crate) fn status(&self) -> PoolStatus {
        self.state.read().status
    }

    pub(crate) fn failure(&self) -> Option<String> {
        self.state.read().failure.clone()
    }

    pub(crate) fn set_status(&self, status: PoolStatus) {
        let mut state = self.state.write();
        // Failed is sticky
        if state.status != PoolStatus::Failed {
            state.status = status;
        }
    }

    /// Move to Closing/Stopping; returns false if the pool already stopped
    pub(crate) fn begin_shutdown(&self, mode: ShutdownMode) -> bool {
        {
            let mut state = self.state.write();
            match state.status {
                PoolStatus::Stopped => return false,
                PoolStatus::Failed | PoolStatus::Stopping => {}
                PoolStatus::Created | PoolStatus::Running | PoolStatus::Closing => {
                    state.status = match mode {
                        ShutdownMode::Drain => PoolStatus::Closing,
                        ShutdownMode::Graceful | ShutdownMode::Immediate => PoolStatus::Stopping,
                    };
                }
            }
        }

        self.queue.close();
        self.send(Command::Shutdown(mode));
        true
    }

    /// Record an unrecoverable failure
    pub(crate) fn fail(&self, message: String) {
        {
            let mut state = self.state.write();
            state.status = PoolStatus::Failed;
            state.failure.get_or_insert(message);
        }
        self.queue.close();
    }

    /// Error for a submission in the current state, if it must be refused
    pub(crate) fn admission_error(&self) -> Option<PoolError> {
        let state = self.state.read();
        match state.status {
            PoolStatus::Running => None,
            PoolStatus::Failed => Some(PoolError::Failed(
                state.failure.clone().unwrap_or_default(),
            )),
            status => Some(PoolError::NotRunning(status)),
        }
    }

    // =========================================================================
    // Task registry
    // =========================================================================

    pub(crate) fn register(&self, task: &Task) -> Result<(), PoolError> {
        let mut tasks = self.tasks.lock();
        // A finished task may linger until its terminal hook runs
        if tasks.get(task.id()).is_some_and(|existing| !existing.done()) {
            return Err(PoolError::DuplicateTask(task.id().clone()));
        }
        tasks.insert(task.id().clone(), task.clone());
        Ok(())
    }

    pub(crate) fn unregister(&self, task: &Task) {
        let mut tasks = self.tasks.lock();
        if tasks.get(task.id()).is_some_and(|t| t.ptr_eq(task)) {
            tasks.remove(task.id());
        }
    }

    pub(crate) fn lookup(&self, id: &TaskId) -> Option<Task> {
        self.tasks.lock().get(id).filter(|t| !t.done()).cloned()
    }

    pub(crate) fn live_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    // =========================================================================
    // Supervisor plumbing
    // =========================================================================

    pub(crate) fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Supervisor gone, command dropped");
        }
    }

    pub(crate) fn counts(&self) -> WorkerCounts {
        *self.counts.lock()
    }

    pub(crate) fn publish_counts(&self, counts: WorkerCounts) {
        *self.counts.lock() = counts;
    }

    pub(crate) fn set_callback_thread(&self, id: Option<ThreadId>) {
        if let Some(id) = id {
            let _ = self.callback_thread.set(id);
        }
    }

    /// Whether the caller is running one of this pool's completion callbacks
    pub(crate) fn on_callback_thread(&self) -> bool {
        self.callback_thread.get() == Some(&std::thread::current().id())
    }

    pub(crate) fn mark_terminated(&self) {
        *self.terminated.lock() = true;
        self.terminated_cv.notify_all();
    }

    /// Wait for the supervisor to finish; returns false on timeout
    pub(crate) fn wait_terminated(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut terminated = self.terminated.lock();

        while !*terminated {
            match deadline {
                None => self.terminated_cv.wait(&mut terminated),
                Some(deadline) => {
                    if self
                        .terminated_cv
                        .wait_until(&mut terminated, deadline)
                        .timed_out()
                    {
                        return *terminated;
                    }
                }
            }
        }
        true
    }
}

impl TaskHooks for PoolShared {
    fn on_terminal(&self, task: &Task, previous: TaskState, worker: Option<WorkerId>) {
        self.unregister(task);

        match previous {
            TaskState::Queued => {
                self.queue.remove(task.id());
            }
            TaskState::Running if task.state() == TaskState::Cancelled => {
                if let Some(worker) = worker {
                    self.send(Command::Cancel {
                        task: task.id().clone(),
                        worker,
                    });
                }
            }
            _ => {}
        }
    }
}
