//! Serialization contract at the channel boundary

use super::{ChannelError, Request, Response};

/// Converts channel messages to and from frame bodies
///
/// The engine only moves opaque byte frames; a codec decides their contents.
pub trait Codec: Send + Sync + 'static {
    /// Codec name, for logs
    fn name(&self) -> &'static str;

    fn encode_request(&self, request: &Request) -> Result<Vec<u8>, ChannelError>;

    fn decode_request(&self, frame: &[u8]) -> Result<Request, ChannelError>;

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>, ChannelError>;

    fn decode_response(&self, frame: &[u8]) -> Result<Response, ChannelError>;
}

/// JSON codec (serde_json)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_request(&self, request: &Request) -> Result<Vec<u8>, ChannelError> {
        serde_json::to_vec(request).map_err(|e| ChannelError::Encode(e.to_string()))
    }

    fn decode_request(&self, frame: &[u8]) -> Result<Request, ChannelError> {
        serde_json::from_slice(frame).map_err(|e| ChannelError::Decode(e.to_string()))
    }

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>, ChannelError> {
        serde_json::to_vec(response).map_err(|e| ChannelError::Encode(e.to_string()))
    }

    fn decode_response(&self, frame: &[u8]) -> Result<Response, ChannelError> {
        serde_json::from_slice(frame).map_err(|e| ChannelError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPayload;

    #[test]
    fn test_json_codec_requests() {
        let codec = JsonCodec;
        let request = Request::Init {
            max_tasks: 3,
            initializer: Some(TaskPayload::new("setup")),
        };

        let frame = codec.encode_request(&request).unwrap();
        assert_eq!(codec.decode_request(&frame).unwrap(), request);
    }

    #[test]
    fn test_decode_garbage() {
        let error = JsonCodec.decode_response(b"\x00\x01not json").unwrap_err();
        assert!(matches!(error, ChannelError::Decode(_)));
    }

    #[test]
    fn test_codec_is_object_safe() {
        let codec: Box<dyn Codec> = Box::new(JsonCodec);
        assert_eq!(codec.name(), "json");
    }
}
