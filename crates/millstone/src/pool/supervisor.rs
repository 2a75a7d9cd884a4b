//! Supervisor: the single control loop owning workers and task dispatch
//!
//! Each pass of the loop:
//! 1. applies worker events and caller commands,
//! 2. inspects workers (death before deadline),
//! 3. restores the pool size,
//! 4. hands queued tasks to idle workers,
//! 5. publishes counters and checks for shutdown completion.
//!
//! Nothing in the loop waits on user code: replacement workers start as
//! background tasks and completion callbacks run on the notifier thread.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::notifier::Notifier;
use super::shared::{Command, PoolShared, WorkerCounts};
use super::{PoolStatus, ShutdownMode};
use crate::channel::Request;
use crate::error::{ExitInfo, PoolError, TaskError, WorkerExpired};
use crate::task::Task;
use crate::worker::{
    SpawnError, Termination, Worker, WorkerEvent, WorkerEventKind, WorkerFactory, WorkerId,
};

/// Supervisor view of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    /// Spawned, initializer not finished
    Starting,
    Idle,
    Busy,
    /// Asked or forced to exit; no further dispatch
    Terminating,
    /// Exit observed; slot is reaped and removed
    Dead,
}

struct Slot {
    worker: Box<dyn Worker>,
    state: WorkerState,
    task: Option<Task>,
    dispatched: usize,
    /// Disconnected event processed: every earlier event has been applied
    disconnected: bool,
}

impl Slot {
    fn is_live(&self) -> bool {
        matches!(
            self.state,
            WorkerState::Starting | WorkerState::Idle | WorkerState::Busy
        )
    }
}

/// Why a running task is being taken away from its worker
#[derive(Debug, Clone, Copy)]
enum Reclaim {
    Timeout,
    Cancelled,
}

type Spawned = (WorkerId, Result<Box<dyn Worker>, SpawnError>);

pub(crate) struct Supervisor {
    shared: Arc<PoolShared>,
    factory: Arc<dyn WorkerFactory>,
    notifier: Notifier,
    workers: BTreeMap<WorkerId, Slot>,
    events_tx: UnboundedSender<WorkerEvent>,
    events_rx: UnboundedReceiver<WorkerEvent>,
    commands: UnboundedReceiver<Command>,
    spawned_tx: UnboundedSender<Spawned>,
    spawned_rx: UnboundedReceiver<Spawned>,
    /// Replacement spawns started but not yet reported on `spawned_rx`
    pending_spawns: usize,
    next_id: u64,
    shutdown: Option<ShutdownMode>,
    failure_handled: bool,
    counts: WorkerCounts,
}

impl Supervisor {
    pub(crate) fn new(
        shared: Arc<PoolShared>,
        factory: Arc<dyn WorkerFactory>,
        notifier: Notifier,
        commands: UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (spawned_tx, spawned_rx) = mpsc::unbounded_channel();

        Self {
            shared,
            factory,
            notifier,
            workers: BTreeMap::new(),
            events_tx,
            events_rx,
            commands,
            spawned_tx,
            spawned_rx,
            pending_spawns: 0,
            next_id: 1,
            shutdown: None,
            failure_handled: false,
            counts: WorkerCounts::default(),
        }
    }

    /// Spawn the initial workers
    pub(crate) async fn start(&mut self) -> Result<(), PoolError> {
        for _ in 0..self.shared.config.workers {
            if let Err(e) = self.spawn_worker().await {
                self.abort_startup().await;
                return Err(e.into());
            }
        }

        self.shared.set_status(PoolStatus::Running);
        self.publish_counts();

        info!(
            kind = %self.shared.kind,
            workers = self.shared.config.workers,
            max_tasks_per_worker = self.shared.config.max_tasks_per_worker,
            "Pool started"
        );
        Ok(())
    }

    /// Run until shutdown completes
    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(self.shared.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some((id, result)) = self.spawned_rx.recv() => self.handle_spawned(id, result),
                _ = self.shared.wakeup.notified() => {}
                _ = tick.tick() => {}
            }

            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_event(event);
            }
            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command);
            }
            while let Ok((id, result)) = self.spawned_rx.try_recv() {
                self.handle_spawned(id, result);
            }

            self.inspect_workers().await;
            self.maintain_pool();
            self.dispatch();
            self.retire_idle_workers();
            self.publish_counts();

            if self.finished() {
                break;
            }
        }

        self.shared.set_status(PoolStatus::Stopped);
        info!(status = %self.shared.status(), "Pool stopped");
        // Dropping self joins the notifier: callbacks finish before joiners wake
    }

    // =========================================================================
    // Events and commands
    // =========================================================================

    fn handle_event(&mut self, event: WorkerEvent) {
        let Some(slot) = self.workers.get_mut(&event.worker) else {
            debug!(worker_id = %event.worker, "Discarding event from abandoned worker");
            return;
        };

        match event.kind {
            WorkerEventKind::Ready => {
                if slot.state == WorkerState::Starting {
                    slot.state = WorkerState::Idle;
                    debug!(worker_id = %event.worker, "Worker ready");
                }
            }
            WorkerEventKind::InitFailed(error) => {
                error!(worker_id = %event.worker, error = %error, "Worker initializer failed");
                slot.state = WorkerState::Terminating;
                self.fail(format!("worker initializer failed: {}", error));
            }
            WorkerEventKind::Completed { task, outcome } => {
                let owned = slot.task.as_ref().is_some_and(|t| t.id() == &task);
                if !owned {
                    debug!(worker_id = %event.worker, task_id = %task, "Discarding stale result");
                    return;
                }

                if let Some(task) = slot.task.take() {
                    self.notifier
                        .finish(&task, outcome.map_err(TaskError::Application));
                }
                self.counts.completed += 1;

                let limit = self.shared.config.max_tasks_per_worker;
                slot.state = if limit > 0 && slot.dispatched >= limit {
                    debug!(worker_id = %event.worker, "Worker reached task limit, rotating");
                    WorkerState::Terminating
                } else {
                    WorkerState::Idle
                };
            }
            WorkerEventKind::Disconnected => {
                slot.disconnected = true;
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Cancel { task, worker } => {
                let owned = self
                    .workers
                    .get(&worker)
                    .and_then(|slot| slot.task.as_ref())
                    .is_some_and(|t| t.id() == &task);

                if owned {
                    info!(task_id = %task, worker_id = %worker, "Reclaiming worker of cancelled task");
                    self.reclaim(worker, Reclaim::Cancelled);
                }
            }
            Command::Shutdown(mode) => self.begin_shutdown(mode),
        }
    }

    // =========================================================================
    // Liveness and deadlines
    // =========================================================================

    async fn inspect_workers(&mut self) {
        let mut expired_deadlines = Vec::new();

        for (id, slot) in self.workers.iter_mut() {
            if slot.state == WorkerState::Dead {
                continue;
            }

            // Death is checked first: it wins over a deadline expiring in the same pass
            if slot.disconnected {
                if let Some(exit) = slot.worker.poll_exit() {
                    let previous = slot.state;
                    slot.state = WorkerState::Dead;

                    if let Some(task) = slot.task.take() {
                        warn!(
                            worker_id = %id,
                            pid = ?slot.worker.pid(),
                            task_id = %task.id(),
                            exit = %exit,
                            "Worker expired while running task"
                        );
                        self.counts.expired += 1;
                        self.notifier.finish(
                            &task,
                            Err(TaskError::WorkerExpired(WorkerExpired {
                                worker: *id,
                                pid: slot.worker.pid(),
                                exit,
                            })),
                        );
                    } else if previous == WorkerState::Starting {
                        self.shared.fail(format!(
                            "{} exited during initialization ({})",
                            id, exit
                        ));
                    } else if previous != WorkerState::Terminating {
                        warn!(worker_id = %id, exit = %exit, "Idle worker exited unexpectedly");
                    } else {
                        debug!(worker_id = %id, exit = %exit, "Worker exited");
                    }
                    continue;
                }
            }

            if let (WorkerState::Busy, Some(task)) = (slot.state, slot.task.as_ref()) {
                let elapsed = task.started_at().map(|s| s.elapsed());
                if let (Some(limit), Some(elapsed)) = (task.timeout(), elapsed) {
                    if elapsed >= limit {
                        expired_deadlines.push(*id);
                    }
                }
            }
        }

        if self.shared.status() == PoolStatus::Failed {
            self.fail_all();
        }

        for id in expired_deadlines {
            self.reclaim(id, Reclaim::Timeout);
        }

        self.reap_dead().await;
    }

    /// Take the running task away from a worker and stop or abandon the worker
    fn reclaim(&mut self, id: WorkerId, reason: Reclaim) {
        let Some(slot) = self.workers.get_mut(&id) else {
            return;
        };
        let Some(task) = slot.task.take() else {
            return;
        };

        if let Reclaim::Timeout = reason {
            let limit = task.timeout().unwrap_or_default();
            warn!(
                worker_id = %id,
                task_id = %task.id(),
                timeout_ms = limit.as_millis() as u64,
                "Task timed out"
            );
            self.counts.timed_out += 1;
            self.notifier.finish(&task, Err(TaskError::Timeout { limit }));
        }

        match slot.worker.terminate() {
            Termination::Terminated => {
                slot.state = WorkerState::Terminating;
            }
            Termination::Unsupported => {
                debug!(worker_id = %id, ?reason, "Abandoning worker that cannot be interrupted");
                // Dropping the handle detaches the thread; its late result is ignored
                self.workers.remove(&id);
            }
        }
    }

    async fn reap_dead(&mut self) {
        let dead: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, slot)| slot.state == WorkerState::Dead)
            .map(|(id, _)| *id)
            .collect();

        for id in dead {
            if let Some(mut slot) = self.workers.remove(&id) {
                slot.worker.reap(self.shared.config.shutdown_grace).await;
            }
        }
    }

    // =========================================================================
    // Pool size and dispatch
    // =========================================================================

    fn maintain_pool(&mut self) {
        if self.shared.status() == PoolStatus::Failed {
            return;
        }
        match self.shutdown {
            None => {}
            // Keep draining the queue even if workers die or rotate
            Some(ShutdownMode::Drain) if !self.shared.queue.is_empty() => {}
            Some(_) => return,
        }

        let live = self.workers.values().filter(|s| s.is_live()).count();
        for _ in (live + self.pending_spawns)..self.shared.config.workers {
            self.request_spawn();
        }
    }

    fn next_worker_id(&mut self) -> WorkerId {
        let id = WorkerId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Start a replacement worker in the background; it arrives on `spawned_rx`
    fn request_spawn(&mut self) {
        let id = self.next_worker_id();
        let factory = Arc::clone(&self.factory);
        let events = self.events_tx.clone();
        let spawned = self.spawned_tx.clone();

        self.pending_spawns += 1;
        debug!(worker_id = %id, "Spawning replacement worker");
        tokio::spawn(async move {
            let result = factory.spawn(id, events).await;
            let _ = spawned.send((id, result));
        });
    }

    fn handle_spawned(&mut self, id: WorkerId, result: Result<Box<dyn Worker>, SpawnError>) {
        self.pending_spawns = self.pending_spawns.saturating_sub(1);

        let worker = match result {
            Ok(worker) => worker,
            Err(e) if self.shared.status() == PoolStatus::Failed => {
                debug!(worker_id = %id, error = %e, "Replacement spawn failed after pool failure");
                return;
            }
            Err(e) => {
                error!(worker_id = %id, error = %e, "Failed to spawn replacement worker");
                self.fail(format!("failed to spawn replacement worker: {}", e));
                return;
            }
        };

        if self.shared.status() == PoolStatus::Failed {
            self.discard(id, worker);
            return;
        }

        if let Err(e) = self.install(id, worker) {
            error!(worker_id = %id, error = %e, "Failed to initialize replacement worker");
            self.fail(format!("failed to spawn replacement worker: {}", e));
        }
    }

    /// Keep a worker that arrived too late only long enough to reap it
    fn discard(&mut self, id: WorkerId, mut worker: Box<dyn Worker>) {
        if worker.terminate() == Termination::Unsupported {
            let _ = worker.send(Request::Shutdown);
        }
        self.workers.insert(
            id,
            Slot {
                worker,
                state: WorkerState::Terminating,
                task: None,
                dispatched: 0,
                disconnected: false,
            },
        );
    }

    /// Spawn one worker and wait for it; used while the pool starts
    async fn spawn_worker(&mut self) -> Result<(), SpawnError> {
        let id = self.next_worker_id();
        let worker = self.factory.spawn(id, self.events_tx.clone()).await?;
        self.install(id, worker)
    }

    /// Send the initializer and start tracking the worker
    fn install(&mut self, id: WorkerId, mut worker: Box<dyn Worker>) -> Result<(), SpawnError> {
        worker
            .send(Request::Init {
                max_tasks: self.shared.config.max_tasks_per_worker,
                initializer: self.shared.config.initializer.clone(),
            })
            .map_err(|e| SpawnError::Io(std::io::Error::other(e.to_string())))?;

        debug!(worker_id = %id, pid = ?worker.pid(), "Worker spawned");

        self.workers.insert(
            id,
            Slot {
                worker,
                state: WorkerState::Starting,
                task: None,
                dispatched: 0,
                disconnected: false,
            },
        );
        Ok(())
    }

    fn dispatch(&mut self) {
        match self.shutdown {
            None | Some(ShutdownMode::Drain) => {}
            Some(_) => return,
        }
        if self.shared.status() == PoolStatus::Failed {
            return;
        }

        for (id, slot) in self.workers.iter_mut() {
            if slot.state != WorkerState::Idle {
                continue;
            }

            let Some(task) = next_startable(&self.shared, *id) else {
                return;
            };

            let request = Request::Execute {
                task: task.id().clone(),
                payload: task.payload().clone(),
            };
            if let Err(e) = slot.worker.send(request) {
                // The disconnect surfaces through liveness checks as an expiry
                debug!(worker_id = %id, error = %e, "Dispatch to closed worker");
            }

            debug!(worker_id = %id, task_id = %task.id(), function = %task.payload().function, "Dispatched task");
            slot.state = WorkerState::Busy;
            slot.task = Some(task);
            slot.dispatched += 1;
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    fn begin_shutdown(&mut self, mode: ShutdownMode) {
        if self.shutdown.is_some_and(|current| current >= mode) {
            return;
        }
        info!(?mode, "Pool shutting down");
        self.shutdown = Some(mode);

        if mode >= ShutdownMode::Graceful {
            self.cancel_queued();
        }

        if mode == ShutdownMode::Immediate {
            let busy: Vec<WorkerId> = self
                .workers
                .iter()
                .filter(|(_, slot)| slot.task.is_some())
                .map(|(id, _)| *id)
                .collect();

            for id in busy {
                if let Some(task) = self.workers.get(&id).and_then(|s| s.task.clone()) {
                    self.notifier.finish(&task, Err(TaskError::Cancelled));
                }
                self.reclaim(id, Reclaim::Cancelled);
            }
        }
    }

    /// Ask idle workers to exit once no more work will be dispatched to them
    fn retire_idle_workers(&mut self) {
        let Some(mode) = self.shutdown else {
            return;
        };
        if mode == ShutdownMode::Drain && !self.shared.queue.is_empty() {
            return;
        }

        for (id, slot) in self.workers.iter_mut() {
            if matches!(slot.state, WorkerState::Idle | WorkerState::Starting) {
                debug!(worker_id = %id, "Stopping worker");
                let _ = slot.worker.send(Request::Shutdown);
                slot.state = WorkerState::Terminating;
            }
        }
    }

    fn finished(&self) -> bool {
        let stopping = self.shutdown.is_some() || self.shared.status() == PoolStatus::Failed;
        stopping
            && self.workers.is_empty()
            && self.pending_spawns == 0
            && self.shared.queue.is_empty()
    }

    fn cancel_queued(&mut self) {
        for task in self.shared.queue.drain() {
            self.notifier.finish(&task, Err(TaskError::Cancelled));
        }
    }

    /// Unrecoverable failure: fail everything and stop
    fn fail(&mut self, message: String) {
        self.shared.fail(message);
        self.fail_all();
    }

    fn fail_all(&mut self) {
        if self.failure_handled {
            return;
        }
        self.failure_handled = true;

        let message = self.shared.failure().unwrap_or_default();
        error!(error = %message, "Pool failed");
        self.shutdown = Some(ShutdownMode::Immediate);

        for task in self.shared.queue.drain() {
            self.notifier
                .finish(&task, Err(TaskError::PoolFailure(message.clone())));
        }

        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            let Some(slot) = self.workers.get_mut(&id) else {
                continue;
            };
            let running = slot.task.take();
            if let Some(task) = &running {
                self.notifier
                    .finish(task, Err(TaskError::PoolFailure(message.clone())));
            }
            if slot.state == WorkerState::Dead {
                continue;
            }

            match slot.worker.terminate() {
                Termination::Terminated => slot.state = WorkerState::Terminating,
                Termination::Unsupported if running.is_some() => {
                    self.workers.remove(&id);
                }
                Termination::Unsupported => {
                    let _ = slot.worker.send(Request::Shutdown);
                    slot.state = WorkerState::Terminating;
                }
            }
        }
    }

    async fn abort_startup(&mut self) {
        let grace = self.shared.config.shutdown_grace;
        for (_, mut slot) in std::mem::take(&mut self.workers) {
            if slot.worker.terminate() == Termination::Unsupported {
                let _ = slot.worker.send(Request::Shutdown);
            }
            slot.worker.reap(grace).await;
        }
    }

    fn publish_counts(&mut self) {
        let mut counts = self.counts;
        counts.workers = self.workers.values().filter(|s| s.is_live()).count();
        counts.idle = self
            .workers
            .values()
            .filter(|s| s.state == WorkerState::Idle)
            .count();
        counts.busy = self
            .workers
            .values()
            .filter(|s| s.state == WorkerState::Busy)
            .count();
        self.shared.publish_counts(counts);
    }
}

/// Pop queued tasks until one can be bound to `worker`
///
/// Tasks cancelled while queued are skipped.
fn next_startable(shared: &PoolShared, worker: WorkerId) -> Option<Task> {
    while let Some(task) = shared.queue.pop() {
        if task.try_start(worker) {
            return Some(task);
        }
        debug!(task_id = %task.id(), state = %task.state(), "Skipping task that left the queue");
    }
    None
}

/// Marks the pool terminated when the supervisor thread ends, even by panic
struct TerminationGuard(Arc<PoolShared>);

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.fail("supervisor panicked".to_string());
        }
        self.0.mark_terminated();
    }
}

/// Drive a supervisor on the current thread until the pool stops
pub(crate) fn run_blocking(
    shared: Arc<PoolShared>,
    factory: Arc<dyn WorkerFactory>,
    commands: UnboundedReceiver<Command>,
    started: std::sync::mpsc::SyncSender<Result<(), PoolError>>,
) {
    let _guard = TerminationGuard(Arc::clone(&shared));

    let notifier = match Notifier::new() {
        Ok(notifier) => notifier,
        Err(e) => {
            let _ = started.send(Err(PoolError::Io(e)));
            return;
        }
    };
    shared.set_callback_thread(notifier.thread_id());

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = started.send(Err(PoolError::Io(e)));
            return;
        }
    };

    runtime.block_on(async {
        let mut supervisor = Supervisor::new(Arc::clone(&shared), factory, notifier, commands);

        match supervisor.start().await {
            Ok(()) => {
                let _ = started.send(Ok(()));
                supervisor.run().await;
            }
            Err(e) => {
                shared.fail(e.to_string());
                let _ = started.send(Err(e));
            }
        }
    });

    runtime.shutdown_timeout(Duration::from_millis(100));
}
