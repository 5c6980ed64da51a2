use thiserror::Error;

use crate::messages::{SiloRequest, SiloResponse};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {what}: {details}")]
    Encode { what: &'static str, details: String },
    #[error("failed to decode {what}: {details}")]
    Decode { what: &'static str, details: String },
}

/// Serialization boundary between protocol messages and transport frames.
/// Frames must not contain a raw `\n`; stream transports use it as the
/// delimiter.
pub trait WireCodec: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode_request(&self, request: &SiloRequest) -> Result<Vec<u8>, CodecError>;
    fn decode_request(&self, frame: &[u8]) -> Result<SiloRequest, CodecError>;
    fn encode_response(&self, response: &SiloResponse) -> Result<Vec<u8>, CodecError>;
    fn decode_response(&self, frame: &[u8]) -> Result<SiloResponse, CodecError>;
}

/// Compact JSON frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_request(&self, request: &SiloRequest) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(request).map_err(|err| CodecError::Encode {
            what: "request",
            details: err.to_string(),
        })
    }

    fn decode_request(&self, frame: &[u8]) -> Result<SiloRequest, CodecError> {
        serde_json::from_slice(frame).map_err(|err| CodecError::Decode {
            what: "request",
            details: err.to_string(),
        })
    }

    fn encode_response(&self, response: &SiloResponse) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(response).map_err(|err| CodecError::Encode {
            what: "response",
            details: err.to_string(),
        })
    }

    fn decode_response(&self, frame: &[u8]) -> Result<SiloResponse, CodecError> {
        serde_json::from_slice(frame).map_err(|err| CodecError::Decode {
            what: "response",
            details: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SessionId;

    #[test]
    fn request_frames_are_single_line_json() {
        let request = SiloRequest::SetCandidateBuckets {
            session: SessionId(7),
            buckets: vec![1, 2, 3],
        };
        let frame = JsonCodec.encode_request(&request).unwrap();
        assert!(!frame.contains(&b'\n'));
        let text = String::from_utf8(frame.clone()).unwrap();
        assert!(text.contains("\"method\":\"set-candidate-buckets\""));
        assert_eq!(JsonCodec.decode_request(&frame).unwrap(), request);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = JsonCodec.decode_response(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode { what: "response", .. }));
    }
}
