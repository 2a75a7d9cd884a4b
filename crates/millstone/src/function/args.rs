//! Typed access to the arguments of a call

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::FunctionError;

/// Arguments passed to a registered function
///
/// Values arrive as JSON and are decoded on access, so a type mismatch becomes
/// an `invalid_arguments` [`FunctionError`] instead of a panic.
///
/// # Example
///
/// ```
/// use millstone::Args;
///
/// let args = Args::new(vec![serde_json::json!(1)], Default::default());
/// let first: i64 = args.get(0).unwrap();
/// assert_eq!(first, 1);
/// assert_eq!(args.kwarg_or("missing", 5i64).unwrap(), 5);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    positional: Vec<Value>,
    keyword: Map<String, Value>,
}

impl Args {
    /// Create arguments from positional and keyword values
    pub fn new(positional: Vec<Value>, keyword: Map<String, Value>) -> Self {
        Self {
            positional,
            keyword,
        }
    }

    /// Number of positional arguments
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    /// Whether there are no arguments at all
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Raw positional arguments
    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    /// Raw keyword arguments
    pub fn keyword(&self) -> &Map<String, Value> {
        &self.keyword
    }

    /// Decode the positional argument at `index`
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, FunctionError> {
        let value = self.positional.get(index).ok_or_else(|| {
            invalid(format!(
                "missing positional argument {} (got {})",
                index,
                self.positional.len()
            ))
        })?;

        decode(value, || format!("positional argument {}", index))
    }

    /// Decode a required keyword argument
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, FunctionError> {
        self.opt_kwarg(name)?
            .ok_or_else(|| invalid(format!("missing keyword argument '{}'", name)))
    }

    /// Decode an optional keyword argument
    pub fn opt_kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, FunctionError> {
        match self.keyword.get(name) {
            Some(value) => decode(value, || format!("keyword argument '{}'", name)).map(Some),
            None => Ok(None),
        }
    }

    /// Decode a keyword argument, falling back to `default` when absent
    pub fn kwarg_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, FunctionError> {
        Ok(self.opt_kwarg(name)?.unwrap_or(default))
    }
}

fn decode<T: DeserializeOwned>(
    value: &Value,
    what: impl FnOnce() -> String,
) -> Result<T, FunctionError> {
    T::deserialize(value).map_err(|e| invalid(format!("{}: {}", what(), e)))
}

fn invalid(message: String) -> FunctionError {
    FunctionError::new(message).with_kind(FunctionError::INVALID_ARGUMENTS)
}
