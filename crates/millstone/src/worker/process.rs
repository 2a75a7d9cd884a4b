//! Process worker (Unix)

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};
use uuid::Uuid;

use super::bootstrap::{SOCKET_ENV, WORKER_ID_ENV};
use super::{
    SpawnError, Termination, Worker, WorkerCommand, WorkerEvent, WorkerFactory, WorkerId,
    WorkerKind,
};
use crate::channel::{length_delimited, ChannelError, Codec, JsonCodec, Request};
use crate::error::ExitInfo;

const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawns [`ProcessWorker`]s from a [`WorkerCommand`]
pub struct ProcessWorkerFactory {
    command: WorkerCommand,
    codec: Arc<dyn Codec>,
    socket_dir: PathBuf,
    tag: String,
    spawn_timeout: Duration,
}

impl ProcessWorkerFactory {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            codec: Arc::new(JsonCodec),
            socket_dir: std::env::temp_dir(),
            tag: Uuid::now_v7().simple().to_string(),
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
        }
    }

    /// Use a different codec
    ///
    /// The worker program must serve with the same codec through
    /// [`run_if_worker_with_codec`](super::bootstrap::run_if_worker_with_codec);
    /// plain `run_if_worker` speaks JSON only.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Directory for the per-worker sockets
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// How long a child may take to connect back
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    fn socket_path(&self, id: WorkerId) -> PathBuf {
        self.socket_dir
            .join(format!("millstone-{}-{}.sock", self.tag, id.as_u64()))
    }
}

enum Startup {
    Connected(std::io::Result<tokio::net::UnixStream>),
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Process
    }

    async fn spawn(
        &self,
        id: WorkerId,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn Worker>, SpawnError> {
        let path = self.socket_path(id);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;

        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .envs(self.command.envs.iter().map(|(k, v)| (k, v)))
            .env(SOCKET_ENV, &path)
            .env(WORKER_ID_ENV, id.as_u64().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }
        };
        let pid = child.id();

        let startup = tokio::select! {
            accepted = listener.accept() => Startup::Connected(accepted.map(|(stream, _)| stream)),
            status = child.wait() => Startup::Exited(status),
            _ = tokio::time::sleep(self.spawn_timeout) => Startup::TimedOut,
        };

        // The connection is established (or abandoned); the path is no longer needed
        drop(listener);
        let _ = std::fs::remove_file(&path);

        let stream = match startup {
            Startup::Connected(Ok(stream)) => stream,
            Startup::Connected(Err(e)) => {
                let _ = child.start_kill();
                return Err(e.into());
            }
            Startup::Exited(status) => {
                let exit = status.map(ExitInfo::from).unwrap_or(ExitInfo::Unknown);
                return Err(SpawnError::ExitedEarly(exit));
            }
            Startup::TimedOut => {
                let _ = child.start_kill();
                return Err(SpawnError::Timeout(self.spawn_timeout));
            }
        };

        debug!(worker_id = %id, pid = ?pid, "Process worker connected");

        let (read_half, write_half) = stream.into_split();
        let disconnected = Arc::new(AtomicBool::new(false));

        // Reader: frames -> events, then a single Disconnected
        let codec = Arc::clone(&self.codec);
        let flag = Arc::clone(&disconnected);
        tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, length_delimited());

            while let Some(frame) = frames.next().await {
                let response = match frame {
                    Ok(frame) => codec.decode_response(&frame),
                    Err(e) => Err(ChannelError::Io(e)),
                };

                match response {
                    Ok(response) => {
                        if events.send(WorkerEvent::from_response(id, response)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(worker_id = %id, error = %e, "Dropping worker channel");
                        break;
                    }
                }
            }

            flag.store(true, Ordering::SeqCst);
            let _ = events.send(WorkerEvent::disconnected(id));
        });

        // Writer: queued frames -> socket
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, length_delimited());
            while let Some(frame) = frames_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!(worker_id = %id, error = %e, "Worker channel write failed");
                    break;
                }
            }
        });

        Ok(Box::new(ProcessWorker {
            id,
            pid,
            child,
            codec: Arc::clone(&self.codec),
            frames: frames_tx,
            disconnected,
            exit: None,
        }))
    }
}

/// Worker backed by a child process
pub struct ProcessWorker {
    id: WorkerId,
    pid: Option<u32>,
    child: Child,
    codec: Arc<dyn Codec>,
    frames: UnboundedSender<Bytes>,
    disconnected: Arc<AtomicBool>,
    exit: Option<ExitInfo>,
}

#[async_trait]
impl Worker for ProcessWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Process
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn send(&mut self, request: Request) -> Result<(), ChannelError> {
        let frame = self.codec.encode_request(&request)?;
        self.frames
            .send(Bytes::from(frame))
            .map_err(|_| ChannelError::Closed)
    }

    fn poll_exit(&mut self) -> Option<ExitInfo> {
        if self.exit.is_some() {
            return self.exit;
        }
        // A result written just before exit must be read before the exit counts
        if !self.disconnected.load(Ordering::SeqCst) {
            return None;
        }

        let exit = match self.child.try_wait() {
            Ok(Some(status)) => ExitInfo::from(status),
            Ok(None) => return None,
            Err(_) => ExitInfo::Unknown,
        };
        self.exit = Some(exit);
        Some(exit)
    }

    fn terminate(&mut self) -> Termination {
        if let Err(e) = self.child.start_kill() {
            debug!(worker_id = %self.id, error = %e, "Kill failed, process already gone");
        }
        Termination::Terminated
    }

    async fn reap(&mut self, grace: Duration) -> ExitInfo {
        if let Some(exit) = self.exit {
            return exit;
        }

        let exit = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => ExitInfo::from(status),
            Ok(Err(_)) => ExitInfo::Unknown,
            Err(_) => {
                warn!(worker_id = %self.id, pid = ?self.pid, "Worker did not exit in time, killing");
                let _ = self.child.start_kill();
                self.child
                    .wait()
                    .await
                    .map(ExitInfo::from)
                    .unwrap_or(ExitInfo::Unknown)
            }
        };

        self.exit = Some(exit);
        exit
    }
}
