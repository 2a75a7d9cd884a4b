//! Ordered, lazy results of `Pool::map`

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;

use crate::error::TaskError;
use crate::function::decode_chunk;
use crate::task::Task;

/// Options for `Pool::map`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    /// Deadline for each chunk, measured from its dispatch
    pub timeout: Option<Duration>,
    /// Inputs per dispatched task
    pub chunk_size: usize,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            chunk_size: 1,
        }
    }
}

impl MapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-chunk deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the number of inputs per task
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

struct Chunk {
    task: Task,
    len: usize,
}

/// Iterator over `map` results in input order
///
/// Each item blocks until its chunk finishes. A failing element yields its
/// error at its own position; a chunk-level failure (timeout, worker expiry,
/// cancellation) is reported at every position of that chunk. Dropping the
/// iterator cancels the chunks not yet consumed.
pub struct MapResults {
    chunks: VecDeque<Chunk>,
    ready: VecDeque<Result<Value, TaskError>>,
}

impl MapResults {
    pub(crate) fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            ready: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, task: Task, len: usize) {
        self.chunks.push_back(Chunk { task, len });
    }

    /// Tasks backing the remaining chunks
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.chunks.iter().map(|chunk| &chunk.task)
    }

    /// Results not yet yielded
    pub fn remaining(&self) -> usize {
        self.ready.len() + self.chunks.iter().map(|c| c.len).sum::<usize>()
    }

    /// Cancel every chunk not yet consumed
    pub fn cancel(&mut self) {
        for chunk in self.chunks.drain(..) {
            chunk.task.cancel();
        }
        self.ready.clear();
    }

    fn expand(chunk: Chunk) -> VecDeque<Result<Value, TaskError>> {
        let len = chunk.len;
        let chunk_error = |error: TaskError| -> VecDeque<Result<Value, TaskError>> {
            std::iter::repeat(Err(error)).take(len).collect()
        };

        match chunk.task.get(None) {
            Ok(value) => match decode_chunk(value) {
                Ok(outcomes) => outcomes
                    .into_iter()
                    .map(|outcome| outcome.map_err(TaskError::Application))
                    .collect(),
                Err(e) => chunk_error(TaskError::Decode(e.to_string())),
            },
            Err(error) => chunk_error(error),
        }
    }
}

impl Iterator for MapResults {
    type Item = Result<Value, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.ready.is_empty() {
            let chunk = self.chunks.pop_front()?;
            self.ready = Self::expand(chunk);
        }
        self.ready.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl Drop for MapResults {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for MapResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapResults")
            .field("chunks", &self.chunks.len())
            .field("remaining", &self.remaining())
            .finish()
    }
}
