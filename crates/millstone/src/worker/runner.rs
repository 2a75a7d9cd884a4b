//! Request handling shared by every worker variant

use tracing::debug;

use crate::channel::{Request, Response};
use crate::function::{execute, FunctionRegistry};

/// What a worker loop does after handling a request
#[derive(Debug)]
pub(crate) enum Step {
    /// Send the response and keep serving
    Reply(Response),
    /// Send the response, then exit
    ReplyAndExit(Response),
    /// Exit without replying
    Exit,
}

/// Worker-side state machine: init, execute until rotation, exit
pub(crate) struct Runner<'a> {
    registry: &'a FunctionRegistry,
    max_tasks: usize,
    completed: usize,
}

impl<'a> Runner<'a> {
    pub(crate) fn new(registry: &'a FunctionRegistry) -> Self {
        Self {
            registry,
            max_tasks: 0,
            completed: 0,
        }
    }

    pub(crate) fn handle(&mut self, request: Request) -> Step {
        match request {
            Request::Init {
                max_tasks,
                initializer,
            } => {
                self.max_tasks = max_tasks;
                match initializer.map(|payload| execute(self.registry, payload)) {
                    Some(Err(error)) => Step::ReplyAndExit(Response::InitFailed { error }),
                    _ => Step::Reply(Response::Ready),
                }
            }
            Request::Execute { task, payload } => {
                let outcome = execute(self.registry, payload);
                let response = Response::Completed { task, outcome };

                self.completed += 1;
                if self.max_tasks > 0 && self.completed >= self.max_tasks {
                    debug!(completed = self.completed, "Task limit reached, worker exiting");
                    Step::ReplyAndExit(response)
                } else {
                    Step::Reply(response)
                }
            }
            Request::Shutdown => Step::Exit,
        }
    }
}
