//! Function execution inside a worker

use std::panic::AssertUnwindSafe;

use serde_json::{Map, Value};

use super::{Args, FunctionRegistry};
use crate::error::FunctionError;
use crate::task::TaskPayload;

/// Result of running one function call
pub type Outcome = Result<Value, FunctionError>;

/// Reserved function name for a batch of calls produced by `Pool::map`
pub const CHUNK_FUNCTION: &str = "millstone::chunk";

/// Run `payload` against `registry`
///
/// Never panics: a panicking function becomes a [`FunctionError`] of kind
/// [`FunctionError::PANIC`], and an unknown name becomes one of kind
/// [`FunctionError::UNKNOWN_FUNCTION`].
pub fn execute(registry: &FunctionRegistry, payload: TaskPayload) -> Outcome {
    if payload.function == CHUNK_FUNCTION {
        return execute_chunk(registry, payload);
    }

    call(
        registry,
        &payload.function,
        Args::new(payload.args, payload.kwargs),
    )
}

fn call(registry: &FunctionRegistry, name: &str, args: Args) -> Outcome {
    let function = registry.get(name).ok_or_else(|| {
        FunctionError::new(format!("no function registered under name: {}", name))
            .with_kind(FunctionError::UNKNOWN_FUNCTION)
    })?;

    match std::panic::catch_unwind(AssertUnwindSafe(|| function(args))) {
        Ok(outcome) => outcome,
        Err(panic) => Err(FunctionError::from_panic(panic)),
    }
}

// =============================================================================
// Chunks
// =============================================================================

/// Build a payload calling `function` once per element of `items`
///
/// Each item holds the positional arguments of one call.
pub(crate) fn chunk_payload(function: &str, items: Vec<Vec<Value>>) -> TaskPayload {
    let mut kwargs = Map::new();
    kwargs.insert("function".to_string(), Value::String(function.to_string()));

    TaskPayload::new(CHUNK_FUNCTION)
        .with_raw_args(items.into_iter().map(Value::Array).collect())
        .with_raw_kwargs(kwargs)
}

/// Split a chunk's value back into per-element outcomes
pub(crate) fn decode_chunk(value: Value) -> Result<Vec<Outcome>, serde_json::Error> {
    serde_json::from_value(value)
}

fn execute_chunk(registry: &FunctionRegistry, payload: TaskPayload) -> Outcome {
    let args = Args::new(Vec::new(), payload.kwargs);
    let function: String = args.kwarg("function")?;

    // A failing element is recorded in place and does not stop the rest
    let outcomes: Vec<Outcome> = payload
        .args
        .into_iter()
        .map(|item| {
            let positional = match item {
                Value::Array(values) => values,
                other => vec![other],
            };
            call(registry, &function, Args::new(positional, Map::new()))
        })
        .collect();

    serde_json::to_value(outcomes).map_err(FunctionError::from)
}
