//! Completion callbacks for tasks resolved by the supervisor
//!
//! The supervisor never runs user callbacks itself: a callback may block
//! (waiting on another task, scheduling into a full queue) and must not stall
//! dispatch, deadlines or liveness checks. Terminal transitions made by the
//! supervisor hand their callbacks to one dedicated thread, which runs them in
//! transition order.

use std::thread::{JoinHandle, ThreadId};

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::task::{Callback, Task};

struct Notification {
    task: Task,
    callbacks: Vec<Callback>,
}

/// Owner of the `millstone-callbacks` thread
///
/// Dropping the notifier waits for every queued callback to finish.
pub(crate) struct Notifier {
    sender: Option<UnboundedSender<Notification>>,
    handle: Option<JoinHandle<()>>,
}

impl Notifier {
    pub(crate) fn new() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = std::thread::Builder::new()
            .name("millstone-callbacks".to_string())
            .spawn(move || serve(receiver))?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    pub(crate) fn thread_id(&self) -> Option<ThreadId> {
        self.handle.as_ref().map(|handle| handle.thread().id())
    }

    /// Resolve `task` and queue its callbacks
    ///
    /// Returns `false` if the task had already finished.
    pub(crate) fn finish(&self, task: &Task, result: Result<Value, TaskError>) -> bool {
        let Some(callbacks) = task.complete(result) else {
            return false;
        };
        if callbacks.is_empty() {
            return true;
        }

        let notification = Notification {
            task: task.clone(),
            callbacks,
        };
        let undelivered = match &self.sender {
            Some(sender) => sender.send(notification).err().map(|e| e.0),
            None => Some(notification),
        };
        if let Some(notification) = undelivered {
            warn!(task_id = %task.id(), "Callback thread gone, running callbacks inline");
            notification.task.run_callbacks(notification.callbacks);
        }
        true
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.sender = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Callback thread panicked");
            }
        }
    }
}

fn serve(mut receiver: UnboundedReceiver<Notification>) {
    while let Some(Notification { task, callbacks }) = receiver.blocking_recv() {
        task.run_callbacks(callbacks);
    }
    debug!("Callback thread exiting");
}
