//! Pool façade

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::map::{MapOptions, MapResults};
use super::queue::PushError;
use super::shared::PoolShared;
use super::supervisor::run_blocking;
use super::{PoolStats, PoolStatus, ShutdownMode};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::function::{chunk_payload, FunctionRegistry, CHUNK_FUNCTION};
use crate::task::{ScheduleOptions, Task, TaskId, TaskPayload};
use crate::worker::{ThreadWorkerFactory, WorkerFactory, WorkerKind};

#[cfg(unix)]
use crate::worker::{ProcessWorkerFactory, WorkerCommand};

/// Worker pool executing registered functions
///
/// Dropping a pool closes it and waits for queued and running tasks to
/// finish, so work scheduled inside a scope completes and every worker is
/// reaped on all exit paths.
///
/// # Example
///
/// ```ignore
/// use millstone::{Args, FunctionError, FunctionRegistry, Pool, PoolConfig, TaskPayload};
///
/// let registry = FunctionRegistry::new().with("add", |args: Args| {
///     Ok::<_, FunctionError>(args.get::<i64>(0)? + args.kwarg_or::<i64>("keyword_argument", 0)?)
/// });
///
/// let pool = Pool::thread(PoolConfig::new(2), registry)?;
/// let task = pool.submit(TaskPayload::new("add").arg(1).kwarg("keyword_argument", 1))?;
/// assert_eq!(task.get(None)?, serde_json::json!(2));
///
/// pool.close();
/// pool.join(None)?;
/// ```
pub struct Pool {
    shared: Arc<PoolShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    /// Start a pool of thread workers
    pub fn thread(config: PoolConfig, registry: FunctionRegistry) -> Result<Self, PoolError> {
        let registry = Arc::new(registry);
        let factory = ThreadWorkerFactory::new(Arc::clone(&registry));
        Self::with_factory(config, registry, factory)
    }

    /// Start a pool of process workers running `command`
    ///
    /// `registry` is the parent's copy, used to reject unknown function names
    /// at `schedule()` time; the worker program must register the same names.
    #[cfg(unix)]
    pub fn process(
        config: PoolConfig,
        registry: FunctionRegistry,
        command: WorkerCommand,
    ) -> Result<Self, PoolError> {
        let factory = ProcessWorkerFactory::new(command).with_spawn_timeout(config.spawn_timeout);
        Self::with_factory(config, Arc::new(registry), factory)
    }

    /// Start a pool with a custom worker factory
    #[instrument(skip_all, fields(workers = config.workers, kind = %factory.kind()))]
    pub fn with_factory<F>(
        config: PoolConfig,
        registry: Arc<FunctionRegistry>,
        factory: F,
    ) -> Result<Self, PoolError>
    where
        F: WorkerFactory + 'static,
    {
        config.validate()?;

        let (shared, commands) = PoolShared::new(config, registry, factory.kind());
        let (started_tx, started_rx) = std::sync::mpsc::sync_channel(1);

        let handle = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("millstone-supervisor".to_string())
                .spawn(move || run_blocking(shared, Arc::new(factory), commands, started_tx))?
        };

        let started = started_rx.recv().unwrap_or_else(|_| {
            Err(PoolError::Failed(
                "supervisor exited during startup".to_string(),
            ))
        });

        if let Err(e) = started {
            let _ = handle.join();
            return Err(e);
        }

        Ok(Self {
            shared,
            supervisor: Mutex::new(Some(handle)),
        })
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Schedule a task, blocking while a bounded queue is full
    ///
    /// Fails fast on unknown function names, unserializable arguments and
    /// duplicate identifiers.
    pub fn schedule(
        &self,
        payload: TaskPayload,
        options: ScheduleOptions,
    ) -> Result<Task, PoolError> {
        self.enqueue(payload, options, true)
    }

    /// Schedule a task, failing with [`PoolError::QueueFull`] instead of blocking
    pub fn try_schedule(
        &self,
        payload: TaskPayload,
        options: ScheduleOptions,
    ) -> Result<Task, PoolError> {
        self.enqueue(payload, options, false)
    }

    /// Schedule a task with default options
    pub fn submit(&self, payload: TaskPayload) -> Result<Task, PoolError> {
        self.schedule(payload, ScheduleOptions::default())
    }

    /// Apply `function` to every input, yielding results in input order
    ///
    /// An input that serializes to a JSON array supplies the positional
    /// arguments of its call (so tuples spread); any other value is passed as
    /// the only argument. Wrap a list in a 1-tuple to pass it whole.
    pub fn map<I, T>(
        &self,
        function: &str,
        inputs: I,
        options: MapOptions,
    ) -> Result<MapResults, PoolError>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        if options.chunk_size == 0 {
            return Err(PoolError::InvalidConfig(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        if !self.shared.registry.contains(function) {
            return Err(PoolError::UnknownFunction(function.to_string()));
        }

        let calls = inputs
            .into_iter()
            .map(|input| match serde_json::to_value(input) {
                Ok(Value::Array(args)) => Ok(args),
                Ok(value) => Ok(vec![value]),
                Err(e) => Err(PoolError::Serialization(e.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut results = MapResults::new();
        let mut calls = calls.into_iter();
        loop {
            let chunk: Vec<Vec<Value>> = calls.by_ref().take(options.chunk_size).collect();
            if chunk.is_empty() {
                break;
            }

            let len = chunk.len();
            // On error `results` drops and cancels the chunks already scheduled
            let task = self.schedule(
                chunk_payload(function, chunk),
                ScheduleOptions::new().with_optional_timeout(options.timeout),
            )?;
            results.push(task, len);
        }

        Ok(results)
    }

    fn enqueue(
        &self,
        payload: TaskPayload,
        options: ScheduleOptions,
        block: bool,
    ) -> Result<Task, PoolError> {
        if let Some(e) = self.shared.admission_error() {
            return Err(e);
        }

        payload.validate()?;
        if payload.function != CHUNK_FUNCTION && !self.shared.registry.contains(&payload.function) {
            return Err(PoolError::UnknownFunction(payload.function));
        }

        let id = options.identifier.unwrap_or_else(TaskId::generate);
        let task = Task::new(
            id,
            payload,
            options.timeout,
            options.callback,
            Some(self.shared.hooks()),
        );

        self.shared.register(&task)?;
        task.mark_queued();

        if let Err(e) = self.shared.queue.push(task.clone(), block) {
            self.shared.unregister(&task);
            return Err(match e {
                PushError::Full => PoolError::QueueFull {
                    capacity: self.shared.queue.capacity(),
                },
                PushError::Closed => self
                    .shared
                    .admission_error()
                    .unwrap_or(PoolError::NotRunning(self.shared.status())),
            });
        }

        self.shared.wakeup.notify_one();
        debug!(
            task_id = %task.id(),
            function = %task.payload().function,
            timeout_ms = task.timeout().map(|t| t.as_millis() as u64),
            "Task scheduled"
        );

        Ok(task)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Current status
    pub fn status(&self) -> PoolStatus {
        self.shared.status()
    }

    /// Failure message, when the pool is [`PoolStatus::Failed`]
    pub fn failure(&self) -> Option<String> {
        self.shared.failure()
    }

    /// Whether submissions are accepted
    pub fn is_running(&self) -> bool {
        self.status() == PoolStatus::Running
    }

    /// Worker variant of this pool
    pub fn kind(&self) -> WorkerKind {
        self.shared.kind
    }

    /// Configuration the pool was started with
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Look up a live (not yet finished) task by id
    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.shared.lookup(id)
    }

    /// Snapshot of pool counters
    pub fn stats(&self) -> PoolStats {
        let counts = self.shared.counts();
        PoolStats {
            status: self.status(),
            workers: counts.workers,
            idle: counts.idle,
            busy: counts.busy,
            pending: self.shared.queue.len(),
            active_tasks: self.shared.live_tasks(),
            completed: counts.completed,
            timed_out: counts.timed_out,
            expired: counts.expired,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop accepting tasks; queued and running tasks still complete
    pub fn close(&self) {
        self.shutdown(ShutdownMode::Drain);
    }

    /// Stop immediately: cancel queued and running tasks
    pub fn stop(&self) {
        self.shutdown(ShutdownMode::Immediate);
    }

    /// Begin shutdown; a stricter mode escalates an earlier one
    #[instrument(skip(self))]
    pub fn shutdown(&self, mode: ShutdownMode) {
        if self.shared.begin_shutdown(mode) {
            info!(?mode, status = %self.status(), "Pool shutdown requested");
        }
    }

    /// Wait for the pool to stop after [`close`](Self::close) or [`stop`](Self::stop)
    ///
    /// Returns once every worker is reaped and every completion callback has
    /// run. Callbacks cannot wait for their own pool this way.
    pub fn join(&self, timeout: Option<Duration>) -> Result<(), PoolError> {
        if self.shared.on_callback_thread() {
            return Err(PoolError::JoinFromCallback);
        }
        if matches!(self.status(), PoolStatus::Created | PoolStatus::Running) {
            return Err(PoolError::StillRunning);
        }

        if !self.shared.wait_terminated(timeout) {
            return Err(PoolError::JoinTimeout);
        }

        if let Some(handle) = self.supervisor.lock().take() {
            if handle.join().is_err() {
                warn!("Supervisor thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close();
        if self.shared.on_callback_thread() {
            // The supervisor finishes on its own; waiting here would wait on ourselves
            debug!("Pool dropped by its own callback, not joining");
            return;
        }
        if let Err(e) = self.join(None) {
            warn!(error = %e, "Pool did not stop cleanly");
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("kind", &self.shared.kind)
            .field("status", &self.status())
            .field("workers", &self.shared.config.workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FunctionError, TaskError};
    use crate::function::Args;
    use crate::task::TaskState;
    use serde_json::json;

    fn registry() -> FunctionRegistry {
        FunctionRegistry::new()
            .with("add", |args: Args| {
                let a: i64 = args.get(0)?;
                let b: i64 = args.kwarg_or("keyword_argument", 0)?;
                Ok::<_, FunctionError>(a + b)
            })
            .with("sleep_ms", |args: Args| {
                let ms: u64 = args.get(0)?;
                std::thread::sleep(Duration::from_millis(ms));
                Ok::<_, FunctionError>(ms)
            })
    }

    fn pool(workers: usize) -> Pool {
        Pool::thread(PoolConfig::new(workers), registry()).unwrap()
    }

    #[test]
    fn test_schedule_and_get() {
        let pool = pool(1);
        let task = pool
            .submit(TaskPayload::new("add").arg(1).kwarg("keyword_argument", 1))
            .unwrap();

        assert_eq!(task.get(Some(Duration::from_secs(5))).unwrap(), json!(2));
        assert_eq!(task.state(), TaskState::Done);
    }

    #[test]
    fn test_unknown_function_fails_fast() {
        let pool = pool(1);
        let result = pool.submit(TaskPayload::new("nope"));
        assert!(matches!(result, Err(PoolError::UnknownFunction(name)) if name == "nope"));
    }

    #[test]
    fn test_duplicate_identifier_rejected() {
        let pool = pool(1);
        let options = || ScheduleOptions::new().with_identifier("same");

        let first = pool
            .schedule(TaskPayload::new("sleep_ms").arg(50), options())
            .unwrap();
        let second = pool.schedule(TaskPayload::new("sleep_ms").arg(50), options());
        assert!(matches!(second, Err(PoolError::DuplicateTask(_))));

        // The identifier is free again once the first task finishes
        first.get(None).unwrap();
        assert!(pool.task(&TaskId::from("same")).is_none());
        pool.schedule(TaskPayload::new("add").arg(1), options())
            .unwrap()
            .get(None)
            .unwrap();
    }

    #[test]
    fn test_try_schedule_reports_full_queue() {
        let registry = registry();
        let pool = Pool::thread(PoolConfig::new(1).with_max_queue_size(1), registry).unwrap();

        let running = pool.submit(TaskPayload::new("sleep_ms").arg(200)).unwrap();
        // Wait until the first task has left the queue
        while running.state() != TaskState::Running {
            std::thread::sleep(Duration::from_millis(5));
        }

        pool.try_schedule(TaskPayload::new("add").arg(1), ScheduleOptions::new())
            .unwrap();
        let full = pool.try_schedule(TaskPayload::new("add").arg(2), ScheduleOptions::new());
        assert!(matches!(full, Err(PoolError::QueueFull { capacity: 1 })));
    }

    #[test]
    fn test_join_requires_shutdown() {
        let pool = pool(1);
        assert!(matches!(pool.join(None), Err(PoolError::StillRunning)));

        pool.close();
        pool.join(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(pool.status(), PoolStatus::Stopped);

        let rejected = pool.submit(TaskPayload::new("add").arg(1));
        assert!(matches!(rejected, Err(PoolError::NotRunning(PoolStatus::Stopped))));
    }

    #[test]
    fn test_close_drains_queue() {
        let pool = pool(1);
        let tasks: Vec<Task> = (0..4)
            .map(|i| pool.submit(TaskPayload::new("add").arg(i)).unwrap())
            .collect();

        pool.close();
        pool.join(Some(Duration::from_secs(5))).unwrap();

        for (i, task) in tasks.iter().enumerate() {
            assert_eq!(task.get(None).unwrap(), json!(i));
        }
    }

    #[test]
    fn test_stop_cancels_queued() {
        let pool = pool(1);
        let running = pool.submit(TaskPayload::new("sleep_ms").arg(100)).unwrap();
        let queued = pool.submit(TaskPayload::new("add").arg(1)).unwrap();

        pool.stop();
        pool.join(Some(Duration::from_secs(5))).unwrap();

        assert!(queued.get(None).unwrap_err().is_cancelled());
        assert!(running.done());
    }

    #[test]
    fn test_invalid_config() {
        let result = Pool::thread(PoolConfig::new(0), registry());
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_map_rejects_zero_chunk_size() {
        let pool = pool(1);
        let result = pool.map("add", [1, 2], MapOptions::new().with_chunk_size(0));
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_stats() {
        let pool = pool(2);
        pool.submit(TaskPayload::new("add").arg(1))
            .unwrap()
            .get(None)
            .unwrap();

        // Counters are published at the end of each supervisor pass
        let mut stats = pool.stats();
        for _ in 0..100 {
            if stats.completed >= 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
            stats = pool.stats();
        }

        assert_eq!(stats.status, PoolStatus::Running);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.workers, 2);
    }

    #[test]
    fn test_timeout_error_kind() {
        let pool = pool(1);
        let task = pool
            .schedule(
                TaskPayload::new("sleep_ms").arg(500),
                ScheduleOptions::new().with_timeout(Duration::from_millis(50)),
            )
            .unwrap();

        let error = task.get(None).unwrap_err();
        assert!(matches!(error, TaskError::Timeout { .. }));
        assert_eq!(task.state(), TaskState::TimedOut);
    }
}
