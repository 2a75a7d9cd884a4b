//! Child side of a process worker
//!
//! ```ignore
//! fn main() {
//!     let registry = build_registry();
//!     // Returns immediately unless this process was started as a worker
//!     millstone::worker::bootstrap::run_if_worker(&registry);
//!
//!     // ... normal program, which may create a process pool
//! }
//! ```
//!
//! A worker installs its own stderr subscriber (filtered by `RUST_LOG` or
//! `MILLSTONE_LOG`) unless the program installed one before the call.

use std::io::{BufReader, BufWriter};
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::{debug, error, info_span};

use super::{Runner, Step};
use crate::channel::{read_frame, write_frame, ChannelError, Codec, JsonCodec};
use crate::function::FunctionRegistry;
use crate::telemetry::{init_logging, LoggingConfig};

/// Socket the worker connects back to
pub const SOCKET_ENV: &str = "MILLSTONE_WORKER_SOCKET";

/// Worker id assigned by the parent pool
pub const WORKER_ID_ENV: &str = "MILLSTONE_WORKER_ID";

/// Whether this process was started as a pool worker
pub fn is_worker() -> bool {
    std::env::var_os(SOCKET_ENV).is_some()
}

/// Serve tasks and exit the process if started as a worker; otherwise return
pub fn run_if_worker(registry: &FunctionRegistry) {
    run_if_worker_with_codec(registry, &JsonCodec);
}

/// [`run_if_worker`] for pools built with
/// [`ProcessWorkerFactory::with_codec`](super::ProcessWorkerFactory::with_codec)
///
/// `codec` must match the one the pool uses.
pub fn run_if_worker_with_codec(registry: &FunctionRegistry, codec: &dyn Codec) {
    let Some(path) = std::env::var_os(SOCKET_ENV) else {
        return;
    };

    init_worker_logging();
    let worker_id = std::env::var(WORKER_ID_ENV).unwrap_or_default();
    let _span = info_span!("worker", worker_id = %worker_id, codec = codec.name()).entered();

    let code = match run_worker(Path::new(&path), registry, codec) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Worker channel failed");
            1
        }
    };

    std::process::exit(code);
}

/// Returns `false` if the program already installed a subscriber
fn init_worker_logging() -> bool {
    init_logging(LoggingConfig::from_env())
}

/// Connect to `socket` and serve requests until told to stop
pub fn run_worker(
    socket: &Path,
    registry: &FunctionRegistry,
    codec: &dyn Codec,
) -> Result<(), ChannelError> {
    let stream = UnixStream::connect(socket)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    let mut runner = Runner::new(registry);

    debug!(pid = std::process::id(), "Worker connected");

    // EOF means the pool went away
    while let Some(frame) = read_frame(&mut reader)? {
        let request = codec.decode_request(&frame)?;

        match runner.handle(request) {
            Step::Reply(response) => {
                write_frame(&mut writer, &codec.encode_response(&response)?)?;
            }
            Step::ReplyAndExit(response) => {
                write_frame(&mut writer, &codec.encode_response(&response)?)?;
                break;
            }
            Step::Exit => break,
        }
    }

    Ok(())
}
