//! Pending task queue with optional capacity

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::task::{Task, TaskId};

/// Why a task was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushError {
    /// Bounded queue at capacity (non-blocking push only)
    Full,
    /// Queue no longer accepts tasks
    Closed,
}

struct QueueInner {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// FIFO of QUEUED tasks
///
/// A capacity of 0 means unbounded. Blocking pushes wait until space frees up
/// or the queue is closed.
pub(crate) struct TaskQueue {
    inner: Mutex<QueueInner>,
    space: Condvar,
    capacity: usize,
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                closed: false,
            }),
            space: Condvar::new(),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn push(&self, task: Task, block: bool) -> Result<(), PushError> {
        let mut inner = self.inner.lock();

        loop {
            if inner.closed {
                return Err(PushError::Closed);
            }
            if self.capacity == 0 || inner.tasks.len() < self.capacity {
                inner.tasks.push_back(task);
                return Ok(());
            }
            if !block {
                return Err(PushError::Full);
            }
            self.space.wait(&mut inner);
        }
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        let task = self.inner.lock().tasks.pop_front();
        if task.is_some() {
            self.space.notify_one();
        }
        task
    }

    /// Remove a task that left the QUEUED state without being dispatched
    pub(crate) fn remove(&self, id: &TaskId) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.tasks.iter().position(|t| t.id() == id) {
                Some(index) => inner.tasks.remove(index).is_some(),
                None => false,
            }
        };
        if removed {
            self.space.notify_one();
        }
        removed
    }

    /// Take every queued task
    pub(crate) fn drain(&self) -> Vec<Task> {
        let tasks: Vec<Task> = self.inner.lock().tasks.drain(..).collect();
        self.space.notify_all();
        tasks
    }

    /// Stop admitting tasks and wake blocked producers
    pub(crate) fn close(&self) {
        self.inner.lock().closed = true;
        self.space.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPayload;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(id: &str) -> Task {
        Task::new(TaskId::from(id), TaskPayload::new("noop"), None, None, None)
    }

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new(0);
        queue.push(task("a"), false).unwrap();
        queue.push(task("b"), false).unwrap();
        queue.push(task("c"), false).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().id().as_str(), "a");
        assert_eq!(queue.pop().unwrap().id().as_str(), "b");
        assert_eq!(queue.pop().unwrap().id().as_str(), "c");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_bounded_non_blocking_push() {
        let queue = TaskQueue::new(1);
        queue.push(task("a"), false).unwrap();
        assert_eq!(queue.push(task("b"), false), Err(PushError::Full));
    }

    #[test]
    fn test_blocking_push_waits_for_space() {
        let queue = Arc::new(TaskQueue::new(1));
        queue.push(task("a"), true).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(task("b"), true))
        };

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop().unwrap().id().as_str(), "a");
        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop().unwrap().id().as_str(), "b");
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let queue = Arc::new(TaskQueue::new(1));
        queue.push(task("a"), true).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(task("b"), true))
        };

        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(producer.join().unwrap(), Err(PushError::Closed));

        // Closed queues still hand out what they hold
        assert!(queue.pop().is_some());
    }

    #[test]
    fn test_remove() {
        let queue = TaskQueue::new(0);
        queue.push(task("a"), false).unwrap();
        queue.push(task("b"), false).unwrap();

        assert!(queue.remove(&TaskId::from("a")));
        assert!(!queue.remove(&TaskId::from("a")));
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
