//! Integration tests for thread-backed pools
//!
//! Run with: cargo test -p millstone --test thread_pool_test

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;

use millstone::prelude::*;
use millstone::worker::{
    SpawnError, ThreadWorkerFactory, Worker, WorkerEvent, WorkerFactory, WorkerId,
};
use millstone::{PoolStatus, TaskId, WorkerKind};

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

thread_local! {
    static INITIALIZED: Cell<i64> = const { Cell::new(0) };
}

/// Registry shared by every test in this file
fn registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .with("add", |args: Args| {
            let value: i64 = args.get(0)?;
            let extra: i64 = args.kwarg_or("keyword_argument", 0)?;
            Ok::<_, FunctionError>(value + extra)
        })
        .with("sleep_ms", |args: Args| {
            let millis: u64 = args.get(0)?;
            std::thread::sleep(Duration::from_millis(millis));
            Ok::<_, FunctionError>(millis)
        })
        .with("fail_on", |args: Args| {
            let value: String = args.get(0)?;
            if value == "b" {
                return Err(FunctionError::new(format!("bad input {}", value)).with_kind("ValueError"));
            }
            Ok(value.to_uppercase())
        })
        .with("panic", |_args: Args| -> Result<(), FunctionError> {
            panic!("worker function exploded")
        })
        .with("thread_name", |_args: Args| {
            std::thread::sleep(Duration::from_millis(50));
            Ok::<_, FunctionError>(std::thread::current().name().map(str::to_string))
        })
        .with("init", |args: Args| {
            let value: i64 = args.get(0)?;
            INITIALIZED.with(|cell| cell.set(value));
            Ok::<_, FunctionError>(())
        })
        .with("init_fail", |_args: Args| -> Result<(), FunctionError> {
            Err(FunctionError::new("initializer refused"))
        })
        .with("initialized", |_args: Args| {
            Ok::<_, FunctionError>(INITIALIZED.with(Cell::get))
        })
}

fn pool(workers: usize) -> Pool {
    Pool::thread(PoolConfig::new(workers), registry()).unwrap()
}

fn wait_for_state(task: &Task, state: TaskState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while task.state() != state {
        assert!(Instant::now() < deadline, "task never reached {}", state);
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// States seen by a task's completion callback, one entry per invocation
#[derive(Clone, Default)]
struct CallbackLog(Arc<Mutex<Vec<TaskState>>>);

impl CallbackLog {
    fn options(&self) -> ScheduleOptions {
        let log = self.clone();
        ScheduleOptions::new().with_callback(move |task| log.0.lock().unwrap().push(task.state()))
    }

    /// Wait for the first invocation, then check no second one follows
    fn single(&self) -> TaskState {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.0.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "callback never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(100));

        let states = self.0.lock().unwrap();
        assert_eq!(states.len(), 1, "callback ran {} times", states.len());
        states[0]
    }
}

/// Thread factory whose spawns after the first `initial` take `delay`
struct SlowReplacements {
    inner: ThreadWorkerFactory,
    spawned: AtomicUsize,
    initial: usize,
    delay: Duration,
}

#[async_trait]
impl WorkerFactory for SlowReplacements {
    fn kind(&self) -> WorkerKind {
        self.inner.kind()
    }

    async fn spawn(
        &self,
        id: WorkerId,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn Worker>, SpawnError> {
        if self.spawned.fetch_add(1, Ordering::SeqCst) >= self.initial {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.spawn(id, events).await
    }
}

#[test_log::test]
fn test_concurrency_is_bounded_by_worker_count() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let registry = {
        let running = running.clone();
        let peak = peak.clone();
        registry().with("track", move |_args: Args| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, FunctionError>(())
        })
    };

    let pool = Pool::thread(PoolConfig::new(2), registry).unwrap();
    let tasks: Vec<Task> = (0..8)
        .map(|_| pool.submit(TaskPayload::new("track")).unwrap())
        .collect();

    for task in &tasks {
        task.get(WAIT).unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[test_log::test]
fn test_positional_and_keyword_arguments() {
    let pool = pool(1);
    let task = pool
        .submit(TaskPayload::new("add").arg(1).kwarg("keyword_argument", 1))
        .unwrap();

    assert_eq!(task.get_as::<i64>(WAIT).unwrap(), 2);
}

#[test_log::test]
fn test_cancel_queued_task_never_runs() {
    let pool = pool(1);
    let calls = Arc::new(AtomicUsize::new(0));

    let blocker = pool.submit(TaskPayload::new("sleep_ms").arg(200)).unwrap();
    wait_for_state(&blocker, TaskState::Running);

    let counter = calls.clone();
    let queued = pool
        .schedule(
            TaskPayload::new("add").arg(1),
            ScheduleOptions::new().with_callback(move |task| {
                assert!(task.cancelled());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    assert!(queued.cancel());
    assert!(!queued.cancel());
    assert_eq!(queued.state(), TaskState::Cancelled);
    assert!(queued.get(WAIT).unwrap_err().is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    blocker.get(WAIT).unwrap();
    // The cancelled task never reached a worker
    assert!(queued.worker().is_none());
}

#[test_log::test]
fn test_timeout_leaves_pool_usable() {
    let pool = pool(1);
    let slow = pool
        .schedule(
            TaskPayload::new("sleep_ms").arg(1000),
            ScheduleOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .unwrap();

    let started = Instant::now();
    let error = slow.get(WAIT).unwrap_err();
    assert!(matches!(error, TaskError::Timeout { limit } if limit == Duration::from_millis(100)));
    assert_eq!(slow.state(), TaskState::TimedOut);
    assert!(started.elapsed() < Duration::from_millis(900));

    // The abandoned worker is replaced
    let next = pool.submit(TaskPayload::new("add").arg(41).kwarg("keyword_argument", 1)).unwrap();
    assert_eq!(next.get(WAIT).unwrap(), json!(42));
}

#[test_log::test]
fn test_wait_timeout_does_not_change_task_state() {
    let pool = pool(1);
    let task = pool.submit(TaskPayload::new("sleep_ms").arg(200)).unwrap();

    let error = task.get(Some(Duration::from_millis(10))).unwrap_err();
    assert!(matches!(error, TaskError::WaitTimeout { .. }));
    assert!(!task.done());

    assert_eq!(task.get(WAIT).unwrap(), json!(200));
}

#[test_log::test]
fn test_map_preserves_order_and_errors() {
    let pool = pool(2);
    let results: Vec<_> = pool
        .map("fail_on", ["a", "b", "c"], MapOptions::new())
        .unwrap()
        .collect();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap(), &json!("A"));
    let error = results[1].as_ref().unwrap_err();
    assert_eq!(error.application().unwrap().kind.as_deref(), Some("ValueError"));
    assert_eq!(results[2].as_ref().unwrap(), &json!("C"));
}

#[test_log::test]
fn test_map_with_chunks() {
    let pool = pool(2);
    let results = pool
        .map("add", 0..10, MapOptions::new().with_chunk_size(3))
        .unwrap();
    assert_eq!(results.remaining(), 10);
    assert_eq!(results.tasks().count(), 4);

    let values: Vec<i64> = results
        .map(|result| serde_json::from_value(result.unwrap()).unwrap())
        .collect();
    assert_eq!(values, (0..10).collect::<Vec<_>>());
}

#[test_log::test]
fn test_work_spreads_across_workers() {
    let pool = pool(2);
    let tasks: Vec<Task> = (0..6)
        .map(|_| pool.submit(TaskPayload::new("thread_name")).unwrap())
        .collect();

    let names: HashSet<String> = tasks
        .iter()
        .map(|task| task.get_as::<Option<String>>(WAIT).unwrap().unwrap())
        .collect();

    assert!(names.len() > 1);
    assert!(names.len() <= 2);
    assert!(names.iter().all(|name| name.starts_with("millstone-worker-")));
}

#[test_log::test]
fn test_workers_rotate_after_task_limit() {
    let pool = Pool::thread(PoolConfig::new(1).with_max_tasks_per_worker(1), registry()).unwrap();

    let mut names = HashSet::new();
    for _ in 0..3 {
        let task = pool.submit(TaskPayload::new("thread_name")).unwrap();
        let name = task.get_as::<Option<String>>(WAIT).unwrap().unwrap();
        names.insert(name);
    }

    assert_eq!(names.len(), 3);
}

#[test_log::test]
fn test_initializer_runs_on_each_worker() {
    let config = PoolConfig::new(2).with_initializer(TaskPayload::new("init").arg(7));
    let pool = Pool::thread(config, registry()).unwrap();

    for _ in 0..4 {
        let task = pool.submit(TaskPayload::new("initialized")).unwrap();
        assert_eq!(task.get_as::<i64>(WAIT).unwrap(), 7);
    }
}

#[test_log::test]
fn test_initializer_failure_fails_pool() {
    let config = PoolConfig::new(1).with_initializer(TaskPayload::new("init_fail"));
    let pool = Pool::thread(config, registry()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while pool.status() != PoolStatus::Failed && pool.status() != PoolStatus::Stopped {
        assert!(Instant::now() < deadline, "pool never failed");
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(pool.failure().unwrap().contains("initializer refused"));
    let rejected = pool.submit(TaskPayload::new("add").arg(1));
    assert!(matches!(rejected, Err(PoolError::Failed(_))));
}

#[test_log::test]
fn test_panic_is_reported_and_pool_survives() {
    let pool = pool(1);
    let task = pool.submit(TaskPayload::new("panic")).unwrap();

    let error = task.get(WAIT).unwrap_err();
    let function_error = error.application().unwrap();
    assert!(function_error.is_panic());
    assert_eq!(function_error.message, "worker function exploded");
    assert_eq!(task.state(), TaskState::Failed);

    let next = pool.submit(TaskPayload::new("add").arg(1)).unwrap();
    assert_eq!(next.get(WAIT).unwrap(), json!(1));
}

#[test_log::test]
fn test_cancel_running_task_frees_pool() {
    let pool = pool(1);
    let task = pool.submit(TaskPayload::new("sleep_ms").arg(2000)).unwrap();
    wait_for_state(&task, TaskState::Running);

    assert!(task.cancel());
    assert!(task.get(WAIT).unwrap_err().is_cancelled());

    let started = Instant::now();
    let next = pool.submit(TaskPayload::new("add").arg(3)).unwrap();
    assert_eq!(next.get(WAIT).unwrap(), json!(3));
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[test_log::test]
fn test_graceful_shutdown_cancels_queued_and_finishes_running() {
    let pool = pool(1);
    let running = pool.submit(TaskPayload::new("sleep_ms").arg(100)).unwrap();
    wait_for_state(&running, TaskState::Running);
    let queued = pool.submit(TaskPayload::new("add").arg(1)).unwrap();

    pool.shutdown(ShutdownMode::Graceful);
    pool.join(WAIT).unwrap();

    assert_eq!(running.get(None).unwrap(), json!(100));
    assert!(queued.get(None).unwrap_err().is_cancelled());
    assert_eq!(pool.status(), PoolStatus::Stopped);
}

#[test_log::test]
fn test_drop_drains_pending_work() {
    let tasks: Vec<Task> = {
        let pool = pool(2);
        let tasks = (0..5)
            .map(|i| pool.submit(TaskPayload::new("add").arg(i)).unwrap())
            .collect();
        tasks
    };

    for (i, task) in tasks.iter().enumerate() {
        assert!(task.done());
        assert_eq!(task.get(None).unwrap(), json!(i));
    }
}

#[test_log::test]
fn test_lookup_by_identifier() {
    let pool = pool(1);
    let task = pool
        .schedule(
            TaskPayload::new("sleep_ms").arg(100),
            ScheduleOptions::new().with_identifier("report"),
        )
        .unwrap();

    let found = pool.task(&TaskId::from("report")).unwrap();
    assert!(found.ptr_eq(&task));
    task.get(WAIT).unwrap();
}

#[test_log::test(tokio::test)]
async fn test_async_wait() {
    let pool = pool(1);
    let task = pool.submit(TaskPayload::new("sleep_ms").arg(20)).unwrap();

    let value = tokio::time::timeout(Duration::from_secs(10), task.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, json!(20));
}

#[test_log::test]
fn test_callbacks_fire_once_per_outcome() {
    let pool = pool(2);

    let success = CallbackLog::default();
    let task = pool
        .schedule(TaskPayload::new("add").arg(1), success.options())
        .unwrap();
    task.get(WAIT).unwrap();
    assert_eq!(success.single(), TaskState::Done);

    let failure = CallbackLog::default();
    let task = pool
        .schedule(TaskPayload::new("fail_on").arg("b"), failure.options())
        .unwrap();
    task.get(WAIT).unwrap_err();
    assert_eq!(failure.single(), TaskState::Failed);

    let timeout = CallbackLog::default();
    let task = pool
        .schedule(
            TaskPayload::new("sleep_ms").arg(1000),
            timeout.options().with_timeout(Duration::from_millis(100)),
        )
        .unwrap();
    task.get(WAIT).unwrap_err();
    // The abandoned worker's late result must not fire it again
    std::thread::sleep(Duration::from_millis(1000));
    assert_eq!(timeout.single(), TaskState::TimedOut);
}

#[test_log::test]
fn test_callback_runs_off_supervisor_and_can_schedule_into_full_queue() {
    let pool = Arc::new(
        Pool::thread(PoolConfig::new(1).with_max_queue_size(1), registry()).unwrap(),
    );
    let (scheduled_tx, scheduled_rx) = std::sync::mpsc::channel();

    let weak = Arc::downgrade(&pool);
    let first = pool
        .schedule(
            TaskPayload::new("sleep_ms").arg(200),
            ScheduleOptions::new().with_callback(move |_task| {
                let thread = std::thread::current().name().map(str::to_string);
                let result = match weak.upgrade() {
                    // Blocks until the supervisor dispatches `second`
                    Some(pool) => pool.submit(TaskPayload::new("add").arg(2)),
                    None => return,
                };
                let _ = scheduled_tx.send((thread, result));
            }),
        )
        .unwrap();
    wait_for_state(&first, TaskState::Running);

    let second = pool.submit(TaskPayload::new("add").arg(1)).unwrap();
    assert_eq!(second.get(WAIT).unwrap(), json!(1));

    let (thread, third) = scheduled_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(thread.as_deref(), Some("millstone-callbacks"));
    assert_eq!(third.unwrap().get(WAIT).unwrap(), json!(2));
    assert_eq!(first.state(), TaskState::Done);
}

#[test_log::test]
fn test_join_waits_for_callbacks() {
    let pool = pool(1);
    let log = CallbackLog::default();
    let slow = log.clone();

    let task = pool
        .schedule(
            TaskPayload::new("add").arg(1),
            ScheduleOptions::new().with_callback(move |task| {
                std::thread::sleep(Duration::from_millis(200));
                slow.0.lock().unwrap().push(task.state());
            }),
        )
        .unwrap();
    task.get(WAIT).unwrap();

    pool.close();
    pool.join(WAIT).unwrap();
    assert_eq!(log.0.lock().unwrap().as_slice(), &[TaskState::Done]);
}

#[test_log::test]
fn test_slow_replacement_spawn_does_not_stall_deadlines() {
    let registry = Arc::new(registry());
    let factory = SlowReplacements {
        inner: ThreadWorkerFactory::new(Arc::clone(&registry)),
        spawned: AtomicUsize::new(0),
        initial: 2,
        delay: Duration::from_secs(3),
    };
    let pool = Pool::with_factory(PoolConfig::new(2), registry, factory).unwrap();

    let first = pool
        .schedule(
            TaskPayload::new("sleep_ms").arg(5000),
            ScheduleOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .unwrap();
    assert!(matches!(first.get(WAIT).unwrap_err(), TaskError::Timeout { .. }));

    // A replacement for the abandoned worker is now starting, slowly
    let started = Instant::now();
    let second = pool
        .schedule(
            TaskPayload::new("sleep_ms").arg(5000),
            ScheduleOptions::new().with_timeout(Duration::from_millis(200)),
        )
        .unwrap();
    assert!(matches!(second.get(WAIT).unwrap_err(), TaskError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));

    let next = pool.submit(TaskPayload::new("add").arg(3)).unwrap();
    assert_eq!(next.get(WAIT).unwrap(), json!(3));

    let deadline = Instant::now() + Duration::from_secs(10);
    while pool.stats().workers != 2 {
        assert!(Instant::now() < deadline, "pool never regained two workers");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test_log::test]
fn test_callback_cannot_join_its_own_pool() {
    let pool = Arc::new(pool(1));
    let (joined_tx, joined_rx) = std::sync::mpsc::channel();

    let weak = Arc::downgrade(&pool);
    let task = pool
        .schedule(
            TaskPayload::new("add").arg(1),
            ScheduleOptions::new().with_callback(move |_task| {
                if let Some(pool) = weak.upgrade() {
                    let _ = joined_tx.send(pool.join(Some(Duration::from_secs(1))));
                }
            }),
        )
        .unwrap();
    task.get(WAIT).unwrap();

    let joined = joined_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(matches!(joined, Err(PoolError::JoinFromCallback)));
}

#[test_log::test]
fn test_callback_may_drop_the_last_pool_handle() {
    let pool = Arc::new(pool(1));
    let (dropped_tx, dropped_rx) = std::sync::mpsc::channel();

    let held = Arc::clone(&pool);
    let task = pool
        .schedule(
            TaskPayload::new("sleep_ms").arg(100),
            ScheduleOptions::new().with_callback(move |_task| {
                drop(held);
                let _ = dropped_tx.send(());
            }),
        )
        .unwrap();
    drop(pool);

    dropped_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(task.get(WAIT).unwrap(), json!(100));
}
