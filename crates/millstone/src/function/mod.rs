//! Registered functions and their execution
//!
//! A [`FunctionRegistry`] is the single source of executable code for a pool.
//! Thread workers share the pool's registry; process workers rebuild the same
//! registry in the child and look functions up by name.

mod args;
mod execute;
mod registry;

pub use args::Args;
pub use execute::{execute, Outcome, CHUNK_FUNCTION};
pub(crate) use execute::{chunk_payload, decode_chunk};
pub use registry::{Function, FunctionRegistry};
