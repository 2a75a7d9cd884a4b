//! Name-keyed registry of callable functions
//!
//! Closures cannot cross a process boundary, so tasks refer to functions by
//! the name they were registered under. A process pool's children must build
//! a registry with the same names as the parent.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::Args;
use crate::error::FunctionError;

/// Type-erased function: JSON arguments in, JSON value or error out
pub type Function = Arc<dyn Fn(Args) -> Result<Value, FunctionError> + Send + Sync>;

/// Registry of functions that workers can execute
///
/// # Example
///
/// ```
/// use millstone::{Args, FunctionError, FunctionRegistry};
///
/// let registry = FunctionRegistry::new().with("add", |args: Args| {
///     let a: i64 = args.get(0)?;
///     let b: i64 = args.kwarg_or("keyword_argument", 0)?;
///     Ok::<_, FunctionError>(a + b)
/// });
///
/// assert!(registry.contains("add"));
/// ```
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Function>,
}

impl FunctionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under `name`, replacing any previous entry
    pub fn register<F, R, E>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(Args) -> Result<R, E> + Send + Sync + 'static,
        R: Serialize,
        E: Into<FunctionError>,
    {
        let erased: Function = Arc::new(move |args: Args| {
            let value = function(args).map_err(Into::into)?;
            serde_json::to_value(value).map_err(|e| {
                FunctionError::new(format!("failed to serialize result: {}", e))
                    .with_kind("serialization")
            })
        });

        self.functions.insert(name.into(), erased);
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<F, R, E>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(Args) -> Result<R, E> + Send + Sync + 'static,
        R: Serialize,
        E: Into<FunctionError>,
    {
        self.register(name, function);
        self
    }

    /// Check if a function is registered
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Look up a function by name
    pub fn get(&self, name: &str) -> Option<Function> {
        self.functions.get(name).cloned()
    }

    /// Get the number of registered functions
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Get all registered function names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}
