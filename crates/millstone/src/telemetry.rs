// Logging initialization
//
// The library itself only emits `tracing` events. Applications (and worker
// processes, whose stdout is discarded) call `init_logging` once to print
// them to stderr.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// ============================================================================
// Logging Configuration
// ============================================================================

/// Configuration for console logging
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log filter (e.g., "info", "debug", "millstone=debug")
    pub log_filter: Option<String>,
    /// Whether to include the event target
    pub with_target: bool,
    /// Whether to include thread names (useful for thread pools)
    pub with_thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            with_target: true,
            with_thread_names: false,
        }
    }
}

impl LoggingConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG` or `MILLSTONE_LOG`: Log filter
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("MILLSTONE_LOG").ok()),
            ..Default::default()
        }
    }

    /// Set the log filter
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Include thread names in every line
    pub fn with_thread_names(mut self, enabled: bool) -> Self {
        self.with_thread_names = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Install a global stderr subscriber
///
/// Returns `false` if a global subscriber was already installed.
///
/// # Example
///
/// ```ignore
/// use millstone::telemetry::{init_logging, LoggingConfig};
///
/// fn main() {
///     init_logging(LoggingConfig::from_env());
///     // ... your application code
/// }
/// ```
pub fn init_logging(config: LoggingConfig) -> bool {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.with_target)
        .with_thread_names(config.with_thread_names)
        .with_filter(config.filter());

    tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_ok()
}
