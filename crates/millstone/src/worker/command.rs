//! Command line used to start process workers

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

/// Program, arguments and environment of a worker process
///
/// The program must call [`run_if_worker`](super::bootstrap::run_if_worker)
/// early in `main` with a registry holding the same function names as the
/// parent's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub(crate) program: PathBuf,
    pub(crate) args: Vec<OsString>,
    pub(crate) envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    /// Run `program` as the worker
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-execute the current binary as the worker
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Re-execute the current test binary, running only the test named `name`
    ///
    /// That test must call `run_if_worker`; outside a worker it returns
    /// immediately, so it passes as an ordinary test.
    pub fn test_entrypoint(name: &str) -> std::io::Result<Self> {
        Ok(Self::current_exe()?.args([
            name,
            "--exact",
            "--nocapture",
            "--test-threads",
            "1",
        ]))
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        args.into_iter().fold(self, |command, arg| command.arg(arg))
    }

    /// Set an environment variable for the worker
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Program path
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_entrypoint_filters_to_one_test() {
        let command = WorkerCommand::test_entrypoint("worker_entrypoint").unwrap();
        assert_eq!(command.args[0], "worker_entrypoint");
        assert!(command.args.iter().any(|a| a == "--exact"));
    }

    #[test]
    fn test_builder() {
        let command = WorkerCommand::new("/usr/bin/worker")
            .arg("--serve")
            .env("RUST_LOG", "debug");

        assert_eq!(command.program(), std::path::Path::new("/usr/bin/worker"));
        assert_eq!(command.args, vec![OsString::from("--serve")]);
        assert_eq!(command.envs.len(), 1);
    }
}
