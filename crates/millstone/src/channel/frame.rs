//! Length-delimited framing
//!
//! Every frame is a 4-byte big-endian body length followed by the body. The
//! controller reads and writes frames with `tokio_util`'s
//! [`LengthDelimitedCodec`]; the worker side uses the blocking helpers below,
//! which produce the same layout.

use std::io::{ErrorKind, Read, Write};

use tokio_util::codec::LengthDelimitedCodec;

use super::ChannelError;

/// Largest accepted frame body
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Codec for the controller side of a channel
pub fn length_delimited() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(HEADER_LEN)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Write one frame and flush
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<(), ChannelError> {
    if body.len() > MAX_FRAME_LENGTH {
        return Err(ChannelError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LENGTH,
        });
    }

    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame
///
/// Returns `Ok(None)` when the peer closed the stream between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, ChannelError> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LENGTH {
        return Err(ChannelError::FrameTooLarge {
            len,
            max: MAX_FRAME_LENGTH,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}
