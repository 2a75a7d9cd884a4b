//! Transport between the pool controller and its workers
//!
//! Process workers exchange [`Request`]/[`Response`] messages as
//! length-delimited frames encoded by a [`Codec`]. Thread workers pass the same
//! messages through in-memory channels without serialization.

mod codec;
mod frame;
mod message;

pub use codec::{Codec, JsonCodec};
pub use frame::{length_delimited, read_frame, write_frame, MAX_FRAME_LENGTH};
pub use message::{Request, Response};

/// Channel transport failure
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Peer hung up
    #[error("channel closed")]
    Closed,
}
