//! Codec for encoding and decoding Switchboard frames.
//!
//! Frames travel as JSON text. Decoding distinguishes three failure modes so
//! the dispatcher can answer each with the right error code: oversized input,
//! an unknown `type`, and a known type with malformed fields.

use serde_json::Value;
use thiserror::Error;

use crate::frames::{InboundFrame, OutboundFrame, INBOUND_TYPES};

/// Default inbound frame ceiling (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured ceiling.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame is not a JSON object with a string `type` field.
    #[error("Invalid frame: {0}")]
    Invalid(String),

    /// Frame `type` is not one the server understands.
    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reject a frame whose serialized size exceeds `max`.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] when `size > max`.
pub fn check_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    Ok(())
}

/// Decode an inbound frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is not a JSON object, the `type` is unknown,
/// or the fields do not match the declared type.
pub fn decode(text: &str) -> Result<InboundFrame, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Invalid(e.to_string()))?;

    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Invalid("missing string field `type`".to_string()))?;

    if !INBOUND_TYPES.contains(&frame_type) {
        return Err(ProtocolError::UnknownType(frame_type.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Invalid(e.to_string()))
}

/// Encode an outbound frame to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &OutboundFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Encode an inbound frame, as a client would.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_inbound(frame: &InboundFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode an outbound frame, as a client would.
///
/// # Errors
///
/// Returns an error if the text is not a valid server frame.
pub fn decode_outbound(text: &str) -> Result<OutboundFrame, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_frame() {
        let frame = decode(r#"{"type":"typing.start","room":"general"}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::TypingStart {
                room: "general".into()
            }
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        match decode(r#"{"type":"room.explode","room":"general"}"#) {
            Err(ProtocolError::UnknownType(t)) => assert_eq!(t, "room.explode"),
            other => panic!("Expected UnknownType error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed_known_type() {
        match decode(r#"{"type":"room.join"}"#) {
            Err(ProtocolError::Invalid(_)) => {}
            other => panic!("Expected Invalid error, got {:?}", other),
        }
        assert!(matches!(decode("not json"), Err(ProtocolError::Invalid(_))));
        assert!(matches!(decode(r#"{"room":"x"}"#), Err(ProtocolError::Invalid(_))));
    }

    #[test]
    fn test_check_size() {
        assert!(check_size(DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE).is_ok());
        match check_size(70_000, DEFAULT_MAX_FRAME_SIZE) {
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                assert_eq!(size, 70_000);
                assert_eq!(max, 65_536);
            }
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_outbound() {
        let text = encode(&OutboundFrame::RoomLeft {
            room: "general".into(),
        })
        .unwrap();
        assert_eq!(text, r#"{"type":"room.left","room":"general"}"#);
        assert_eq!(
            decode_outbound(&text).unwrap(),
            OutboundFrame::RoomLeft {
                room: "general".into()
            }
        );
    }
}
