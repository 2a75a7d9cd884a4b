//! Pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::task::TaskPayload;

/// Pool configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use millstone::PoolConfig;
///
/// let config = PoolConfig::new(4)
///     .with_max_tasks_per_worker(100)
///     .with_max_queue_size(1_000)
///     .with_tick_interval(Duration::from_millis(10));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers kept alive
    pub workers: usize,

    /// Tasks a worker runs before it is replaced (0 disables rotation)
    pub max_tasks_per_worker: usize,

    /// Pending queue capacity (0 = unbounded)
    pub max_queue_size: usize,

    /// Function run once in every worker before its first task
    pub initializer: Option<TaskPayload>,

    /// Supervisor polling interval for liveness and deadlines
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,

    /// How long a process worker may take to connect back
    #[serde(with = "duration_millis")]
    pub spawn_timeout: Duration,

    /// How long to wait for a worker to exit on shutdown before killing it
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_tasks_per_worker: 0,
            max_queue_size: 0,
            initializer: None,
            tick_interval: Duration::from_millis(20),
            spawn_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Create a configuration for `workers` workers
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Reads `MILLSTONE_WORKERS`, `MILLSTONE_MAX_TASKS`,
    /// `MILLSTONE_MAX_QUEUE_SIZE` and `MILLSTONE_TICK_MS`; unset or unparsable
    /// values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            workers: env_parse("MILLSTONE_WORKERS").unwrap_or(defaults.workers),
            max_tasks_per_worker: env_parse("MILLSTONE_MAX_TASKS")
                .unwrap_or(defaults.max_tasks_per_worker),
            max_queue_size: env_parse("MILLSTONE_MAX_QUEUE_SIZE")
                .unwrap_or(defaults.max_queue_size),
            tick_interval: env_parse("MILLSTONE_TICK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            ..defaults
        }
    }

    /// Set the number of workers
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the per-worker task limit (0 disables rotation)
    pub fn with_max_tasks_per_worker(mut self, max: usize) -> Self {
        self.max_tasks_per_worker = max;
        self
    }

    /// Bound the pending queue (0 = unbounded)
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the per-worker initializer
    pub fn with_initializer(mut self, initializer: TaskPayload) -> Self {
        self.initializer = Some(initializer);
        self
    }

    /// Set the supervisor polling interval
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the process worker connect timeout
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Check the configuration for values the pool cannot run with
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.workers == 0 {
            return Err(PoolError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "tick_interval must be non-zero".to_string(),
            ));
        }
        if let Some(initializer) = &self.initializer {
            initializer.validate()?;
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
