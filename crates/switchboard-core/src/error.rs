//! Errors surfaced to clients as `error` frames.

use switchboard_protocol::{OutboundFrame, ProtocolError};
use thiserror::Error;

/// Non-admission failures. Each maps to a stable error-frame code; the
/// connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Room is full: {0}")]
    RoomFull(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Feature disabled: {0}")]
    FeatureDisabled(String),

    #[error("Not subscribed: {0}")]
    NotSubscribed(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable code carried in the error frame.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidFrame(_) => "invalid_frame",
            CoreError::UnknownType(_) => "unknown_type",
            CoreError::PermissionDenied(_) => "permission_denied",
            CoreError::RoomNotFound(_) => "room_not_found",
            CoreError::RoomFull(_) => "room_full",
            CoreError::NotFound(_) => "not_found",
            CoreError::Validation(_) => "validation_error",
            CoreError::FeatureDisabled(_) => "feature_disabled",
            CoreError::NotSubscribed(_) => "not_subscribed",
            CoreError::BrokerUnavailable(_) => "broker_unavailable",
            CoreError::StoreUnavailable(_) => "store_unavailable",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Render as an `error` frame.
    #[must_use]
    pub fn to_frame(&self) -> OutboundFrame {
        OutboundFrame::error(self.code(), self.to_string())
    }
}

impl From<ProtocolError> for CoreError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownType(t) => CoreError::UnknownType(t),
            ProtocolError::FrameTooLarge { size, max } => {
                CoreError::Validation(format!("frame size {} exceeds {}", size, max))
            }
            other => CoreError::InvalidFrame(other.to_string()),
        }
    }
}
