//! Thread worker

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use super::{
    Runner, SpawnError, Step, Termination, Worker, WorkerEvent, WorkerFactory, WorkerId,
    WorkerKind,
};
use crate::channel::{ChannelError, Request};
use crate::error::ExitInfo;
use crate::function::FunctionRegistry;

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Spawns [`ThreadWorker`]s sharing one registry
#[derive(Debug, Clone)]
pub struct ThreadWorkerFactory {
    registry: Arc<FunctionRegistry>,
}

impl ThreadWorkerFactory {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl WorkerFactory for ThreadWorkerFactory {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Thread
    }

    async fn spawn(
        &self,
        id: WorkerId,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn Worker>, SpawnError> {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let disconnected = Arc::new(AtomicBool::new(false));

        let registry = Arc::clone(&self.registry);
        let flag = Arc::clone(&disconnected);
        let handle = std::thread::Builder::new()
            .name(format!("millstone-{}", id))
            .spawn(move || serve(id, registry, requests_rx, events, flag))?;

        debug!(worker_id = %id, "Spawned thread worker");

        Ok(Box::new(ThreadWorker {
            id,
            requests: Some(requests_tx),
            handle: Some(handle),
            disconnected,
            exit: None,
        }))
    }
}

/// Worker backed by a dedicated OS thread
///
/// Dropping the handle abandons the thread: it finishes its current call and
/// exits, and anything it reports afterwards is ignored by the pool.
pub struct ThreadWorker {
    id: WorkerId,
    requests: Option<UnboundedSender<Request>>,
    handle: Option<JoinHandle<()>>,
    disconnected: Arc<AtomicBool>,
    exit: Option<ExitInfo>,
}

impl ThreadWorker {
    fn join(&mut self) -> Option<ExitInfo> {
        let handle = self.handle.take()?;
        let exit = match handle.join() {
            Ok(()) => ExitInfo::Success,
            Err(_) => ExitInfo::Panicked,
        };
        self.exit = Some(exit);
        Some(exit)
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

#[async_trait]
impl Worker for ThreadWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Thread
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn send(&mut self, request: Request) -> Result<(), ChannelError> {
        self.requests
            .as_ref()
            .ok_or(ChannelError::Closed)?
            .send(request)
            .map_err(|_| ChannelError::Closed)
    }

    fn poll_exit(&mut self) -> Option<ExitInfo> {
        if self.exit.is_some() {
            return self.exit;
        }
        if !self.disconnected.load(Ordering::SeqCst) || !self.is_finished() {
            return None;
        }
        self.join()
    }

    fn terminate(&mut self) -> Termination {
        Termination::Unsupported
    }

    async fn reap(&mut self, grace: Duration) -> ExitInfo {
        if let Some(exit) = self.exit {
            return exit;
        }

        // Closing the request channel ends the loop after the current call
        self.requests = None;

        let deadline = Instant::now() + grace;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                warn!(worker_id = %self.id, "Thread worker still busy, detaching");
                self.handle = None;
                return ExitInfo::Unknown;
            }
            tokio::time::sleep(REAP_POLL_INTERVAL).await;
        }

        self.join().unwrap_or(ExitInfo::Unknown)
    }
}

/// Reports the disconnect on every exit path, including panics
struct DisconnectGuard {
    id: WorkerId,
    events: UnboundedSender<WorkerEvent>,
    flag: Arc<AtomicBool>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.events.send(WorkerEvent::disconnected(self.id));
    }
}

fn serve(
    id: WorkerId,
    registry: Arc<FunctionRegistry>,
    mut requests: UnboundedReceiver<Request>,
    events: UnboundedSender<WorkerEvent>,
    flag: Arc<AtomicBool>,
) {
    let _guard = DisconnectGuard {
        id,
        events: events.clone(),
        flag,
    };
    let mut runner = Runner::new(&registry);

    while let Some(request) = requests.blocking_recv() {
        let (response, exit) = match runner.handle(request) {
            Step::Reply(response) => (Some(response), false),
            Step::ReplyAndExit(response) => (Some(response), true),
            Step::Exit => (None, true),
        };

        if let Some(response) = response {
            if events.send(WorkerEvent::from_response(id, response)).is_err() {
                break;
            }
        }
        if exit {
            break;
        }
    }

    debug!(worker_id = %id, "Thread worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FunctionError;
    use crate::function::Args;
    use crate::task::{TaskId, TaskPayload};
    use crate::worker::WorkerEventKind;

    fn factory() -> ThreadWorkerFactory {
        let registry = FunctionRegistry::new().with("add", |args: Args| {
            let a: i64 = args.get(0)?;
            let b: i64 = args.get(1)?;
            Ok::<_, FunctionError>(a + b)
        });
        ThreadWorkerFactory::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_thread_worker_round_trip() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut worker = factory().spawn(WorkerId::new(1), events_tx).await.unwrap();

        assert_eq!(worker.kind(), WorkerKind::Thread);
        assert!(worker.pid().is_none());

        worker
            .send(Request::Init {
                max_tasks: 1,
                initializer: None,
            })
            .unwrap();
        assert!(matches!(
            events_rx.recv().await.unwrap().kind,
            WorkerEventKind::Ready
        ));

        let task = TaskId::generate();
        worker
            .send(Request::Execute {
                task: task.clone(),
                payload: TaskPayload::new("add").arg(1).arg(2),
            })
            .unwrap();

        match events_rx.recv().await.unwrap().kind {
            WorkerEventKind::Completed { task: id, outcome } => {
                assert_eq!(id, task);
                assert_eq!(outcome.unwrap(), serde_json::json!(3));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // max_tasks = 1: the worker rotates out on its own
        assert!(matches!(
            events_rx.recv().await.unwrap().kind,
            WorkerEventKind::Disconnected
        ));
        assert_eq!(worker.reap(Duration::from_secs(1)).await, ExitInfo::Success);
    }

    #[tokio::test]
    async fn test_thread_worker_cannot_terminate() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut worker = factory().spawn(WorkerId::new(2), events_tx).await.unwrap();

        assert_eq!(worker.terminate(), Termination::Unsupported);
        assert!(worker.poll_exit().is_none());

        worker.send(Request::Shutdown).unwrap();
        assert_eq!(worker.reap(Duration::from_secs(1)).await, ExitInfo::Success);
    }
}
