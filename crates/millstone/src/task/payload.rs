//! Task payloads and scheduling options

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Task, TaskId};
use crate::error::PoolError;

/// Unit of work shipped to a worker: a registered function name plus its arguments
///
/// Arguments are converted to JSON when they are added. A conversion failure is
/// remembered and reported by `schedule()` so non-serializable payloads fail
/// fast on the caller's side instead of inside a worker.
///
/// # Example
///
/// ```
/// use millstone::TaskPayload;
///
/// let payload = TaskPayload::new("add")
///     .arg(1)
///     .kwarg("keyword_argument", 1);
///
/// assert_eq!(payload.function, "add");
/// assert_eq!(payload.args.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Registered function name
    pub function: String,

    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword arguments
    #[serde(default)]
    pub kwargs: Map<String, Value>,

    /// First argument conversion failure, reported at schedule time
    #[serde(skip)]
    encode_error: Option<String>,
}

impl TaskPayload {
    /// Create a payload calling `function` with no arguments
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            encode_error: None,
        }
    }

    /// Append a positional argument
    pub fn arg<T: Serialize>(mut self, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => self.args.push(value),
            Err(err) => self.record_error(format!("argument {}: {}", self.args.len(), err)),
        }
        self
    }

    /// Append several positional arguments
    pub fn args<I, T>(self, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        values.into_iter().fold(self, |payload, value| payload.arg(value))
    }

    /// Set a keyword argument
    pub fn kwarg<T: Serialize>(mut self, name: impl Into<String>, value: T) -> Self {
        let name = name.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.kwargs.insert(name, value);
            }
            Err(err) => self.record_error(format!("keyword argument {}: {}", name, err)),
        }
        self
    }

    /// Use already-converted positional arguments
    pub fn with_raw_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Use already-converted keyword arguments
    pub fn with_raw_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Report an argument that could not be converted
    pub fn validate(&self) -> Result<(), PoolError> {
        match &self.encode_error {
            Some(err) => Err(PoolError::Serialization(err.clone())),
            None => Ok(()),
        }
    }

    fn record_error(&mut self, err: String) {
        if self.encode_error.is_none() {
            self.encode_error = Some(err);
        }
    }
}

/// Completion callback, invoked exactly once with the finished task
pub type Callback = Box<dyn FnOnce(&Task) + Send + 'static>;

/// Per-submission options for `Pool::schedule`
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use millstone::ScheduleOptions;
///
/// let options = ScheduleOptions::new()
///     .with_timeout(Duration::from_secs(5))
///     .with_identifier("nightly-report");
/// ```
#[derive(Default)]
pub struct ScheduleOptions {
    /// Execution deadline, measured from dispatch to a worker
    pub timeout: Option<Duration>,

    /// Caller-supplied identifier (generated if absent)
    pub identifier: Option<TaskId>,

    /// Callback fired when the task reaches a terminal state
    pub callback: Option<Callback>,
}

impl ScheduleOptions {
    /// Create options with no deadline, generated id and no callback
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set an optional execution deadline
    pub fn with_optional_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the task identifier
    pub fn with_identifier(mut self, id: impl Into<TaskId>) -> Self {
        self.identifier = Some(id.into());
        self
    }

    /// Set the completion callback
    ///
    /// Runs on the thread that cancels the task, or on the pool's
    /// `millstone-callbacks` thread for every outcome the pool decides
    /// (results, errors, timeouts, worker loss, shutdown). Callbacks of one
    /// pool run one at a time, so a slow callback delays the next.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for ScheduleOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleOptions")
            .field("timeout", &self.timeout)
            .field("identifier", &self.identifier)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_payload_builder() {
        let payload = TaskPayload::new("function")
            .arg(1)
            .args(["a", "b"])
            .kwarg("keyword_argument", 1);

        assert_eq!(payload.function, "function");
        assert_eq!(
            payload.args,
            vec![serde_json::json!(1), serde_json::json!("a"), serde_json::json!("b")]
        );
        assert_eq!(payload.kwargs["keyword_argument"], serde_json::json!(1));
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn test_unserializable_argument_fails_validation() {
        // JSON object keys must be strings
        let mut map = HashMap::new();
        map.insert((1, 2), "value");

        let payload = TaskPayload::new("function").arg(1).arg(map);

        assert_eq!(payload.args.len(), 1);
        assert!(matches!(
            payload.validate(),
            Err(PoolError::Serialization(_))
        ));
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = TaskPayload::new("function").arg(1);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"function": "function", "args": [1], "kwargs": {}})
        );

        let parsed: TaskPayload =
            serde_json::from_value(serde_json::json!({"function": "noop"})).unwrap();
        assert!(parsed.args.is_empty());
        assert!(parsed.kwargs.is_empty());
    }

    #[test]
    fn test_schedule_options_builder() {
        let options = ScheduleOptions::new()
            .with_timeout(Duration::from_millis(100))
            .with_identifier("foo")
            .with_callback(|_task| {});

        assert_eq!(options.timeout, Some(Duration::from_millis(100)));
        assert_eq!(options.identifier, Some(TaskId::from("foo")));
        assert!(options.callback.is_some());
    }
}
